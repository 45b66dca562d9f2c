/// Types that contribute a file extension to an artifact name.
pub trait FileExtProvider {
    fn file_ext(&self) -> Option<&'static str>;
}
