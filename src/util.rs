pub(crate) mod atomic;
pub(crate) mod hashing;
