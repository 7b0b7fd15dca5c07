//! File/trace source consumed per worker: turns a trace path into a
//! chunked byte stream. Chunk sizing is implementation-defined.

use crate::error::Error;
use bigtrace_async::Stream;

pub trait FileSource: Send + Sync {
    fn read_file(&self, path: &str) -> Stream<Result<Vec<u8>, Error>>;
}
