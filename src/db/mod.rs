pub mod models;
pub mod writer;

pub use writer::{DbWriter, ParameterSetInsert, WriteCommand, WriterHandle};
