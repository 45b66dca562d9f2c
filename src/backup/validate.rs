//! Validation functions for configuration values.
//!
//! Provides custom validation functions for set names, destination folders and
//! remote folders.

use sanitize_filename::{is_sanitized, sanitize};
use validator::ValidationError;

use std::path::Path;

pub fn validate_set_name<S: AsRef<str>>(name: S) -> Result<(), ValidationError> {
    let name = name.as_ref();
    if name.is_empty() {
        return Err(ValidationError::new("InvalidSetName")
            .with_message("Set name must not be empty".into()));
    }
    if !is_sanitized(name) {
        return Err(ValidationError::new("InvalidSetName").with_message(
            format!("Invalid set name, try sanitizing like {:?}", sanitize(name)).into(),
        ));
    }

    Ok(())
}

pub fn validate_dir_exist<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("{:?} not found", dir).into()));
    }

    Ok(())
}

/// Destinations may not exist yet, but must not point at an existing non-directory.
pub fn validate_destination_dir<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.as_os_str().is_empty() {
        return Err(ValidationError::new("InvalidDirectory")
            .with_message("destination must not be empty".into()));
    }
    if dir.exists() && !dir.is_dir() {
        return Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("{:?} is not a directory", dir).into()));
    }

    Ok(())
}

pub fn validate_remote_folder<P: AsRef<Path>>(folder: P) -> Result<(), ValidationError> {
    let folder = folder.as_ref();
    if !folder.has_root() {
        return Err(ValidationError::new("InvalidRemoteFolder")
            .with_message(format!("remote folder {:?} must be absolute", folder).into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_set_name() {
        assert!(validate_set_name("Documents").is_ok());
        assert!(validate_set_name("").is_err());
        assert!(validate_set_name("a/b").is_err());
    }

    #[test]
    fn test_validate_dir_exist() {
        let temp_dir = TempDir::new().unwrap();
        assert!(validate_dir_exist(temp_dir.path()).is_ok());
        assert!(validate_dir_exist(temp_dir.path().join("missing")).is_err());

        let file = temp_dir.path().join("file");
        std::fs::write(&file, "x").unwrap();
        assert!(validate_dir_exist(&file).is_err());
    }

    #[test]
    fn test_validate_destination_dir() {
        let temp_dir = TempDir::new().unwrap();
        assert!(validate_destination_dir(temp_dir.path().join("not-yet")).is_ok());
        assert!(validate_destination_dir("").is_err());

        let file = temp_dir.path().join("file");
        std::fs::write(&file, "x").unwrap();
        assert!(validate_destination_dir(&file).is_err());
    }

    #[test]
    fn test_validate_remote_folder() {
        assert!(validate_remote_folder("/srv/backups").is_ok());
        assert!(validate_remote_folder("backups").is_err());
    }
}
