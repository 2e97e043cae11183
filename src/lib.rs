pub mod codec;
pub mod engine;
pub mod error;
pub mod header;
pub mod io;
pub mod scan;
pub mod seek;
pub mod stream;
pub mod tags;
pub mod wrapper;

pub use engine::{
    update_total_samples, Mode, OpenOptions, PackConfig, Packer, StreamConfig, Unpacker,
    MAX_STREAMS,
};
pub use error::{Error, Result};
pub use header::BlockHeader;
pub use io::{BlockSink, ByteSource, PairSink, PipeSource, SinkDest, StdSource, VecSink};
pub use tags::TagStore;
