use std::io;

pub trait Serialize<'a> {
    /// Writes the head of the frame body into `buf`.
    ///
    /// # Returns
    /// An optional tail that is written right after `buf` without being copied into it.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
