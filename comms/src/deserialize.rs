use std::io;

pub trait Deserialize<'a>: Sized {
    /// Parses `Self` out of a whole frame body, borrowing from it where possible.
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
