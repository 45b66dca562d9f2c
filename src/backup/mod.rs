pub mod cancel;
pub mod commands;
pub mod compress;
pub mod context;
pub mod engine;
pub mod exclude;
pub mod file_ext;
pub mod finish;
pub mod fs_util;
pub mod operation;
pub mod options;
pub mod process;
pub mod progress;
pub mod redacted;
pub mod remote;
pub mod result_error;
pub mod retention;
pub mod snapshot;
pub mod target;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
