//! Weight persistence: the versioned binary format and the named store

mod reader;
mod store;
mod writer;

pub use reader::Reader;
pub use store::WeightStore;
pub use writer::Writer;
