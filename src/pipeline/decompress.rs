use std::fs::File;
use std::io::Write;
use std::sync::mpsc::Sender;
use tracing::info;

use crate::job::Job;
use crate::perf::{WriteBuffer, WRITE_BUFFER_SIZE};
use crate::source::{open_image, ImageSource};

use super::{discard, scheduler, Event, JobError, Outcome, Pipeline, Progress};

/// Read granularity when the input is a raw image.
const RAW_READ_SIZE: u32 = 1 << 16;

pub(super) fn run(
    pipeline: &Pipeline,
    id:       usize,
    job:      &Job,
    events:   &Sender<Event>,
) -> Result<Outcome, JobError> {
    job.validate()?;
    job.check_distinct_output()?;
    let output = job.output_path()?;

    let source = open_image(&job.input, RAW_READ_SIZE)?;
    info!(source = source.variant().map_or("raw", |v| v.name()), raw_size = source.geometry().raw_size, "decompressing");

    let file = File::create(output)?;
    let mut out = WriteBuffer::new(file, WRITE_BUFFER_SIZE);
    let result = decode_all(pipeline, id, source, events, |raw| Ok(out.write_all(raw)?))
        .and_then(|raw_size| {
            let file = out.into_inner()?;
            file.sync_all()?;
            Ok(Outcome::Written { raw_size, written: raw_size })
        });
    if result.is_err() {
        discard(output);
    }
    result
}

/// Decode the image and report the CRC32 of its bytes.
pub(super) fn checksum(
    pipeline: &Pipeline,
    id:       usize,
    job:      &Job,
    events:   &Sender<Event>,
) -> Result<Outcome, JobError> {
    job.validate()?;
    let source = open_image(&job.input, RAW_READ_SIZE)?;
    let mut hasher = crc32fast::Hasher::new();
    let raw_size = decode_all(pipeline, id, source, events, |raw| {
        hasher.update(raw);
        Ok(())
    })?;
    Ok(Outcome::Checksum { raw_size, crc32: hasher.finalize() })
}

/// Decode every block of `source` on the pool and feed the image bytes to
/// `sink` in order.  Returns the image size.
fn decode_all<S>(
    pipeline: &Pipeline,
    id:       usize,
    source:   Box<dyn ImageSource>,
    events:   &Sender<Event>,
    mut sink: S,
) -> Result<u64, JobError>
where
    S: FnMut(&[u8]) -> Result<(), JobError>,
{
    let geometry = source.geometry();
    let decoder = source.decoder();
    let count = geometry.block_count();
    let mut source = source;
    let mut progress = Progress::new(id, geometry.raw_size, events);
    let mut position = 0u64;

    scheduler::run_ordered(
        pipeline.pool(),
        pipeline.max_in_flight(),
        |index| {
            if index == count {
                return Ok(None);
            }
            Ok(Some(source.read_block(index)?))
        },
        move |index, block| Ok(decoder.decode(index, block)?),
        |_, raw: Vec<u8>| {
            sink(&raw)?;
            position += raw.len() as u64;
            progress.update(position, position);
            Ok(())
        },
    )?;
    Ok(position)
}
