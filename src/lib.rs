pub mod codec;
pub mod format;
pub mod block;
pub mod job;
pub mod source;
pub mod perf;
pub mod writer;
pub mod pipeline;

pub use codec::{BlockMethod, Family, Framing, Method, MethodSet};
pub use format::{ContainerFormat, FormatError, FormatVariant, Geometry, IndexEntry, open_index};
pub use block::{encode_block, choose, BlockResult, SelectorConfig};
pub use job::{CodecFlags, ConfigError, Job, Mode};
pub use pipeline::{Event, JobError, JobStatus, Outcome, Pipeline, PipelineOptions};
