use std::fs::File;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tracing::{debug, info};

use crate::block::{encode_block, SelectorConfig};
use crate::format::{FormatError, Geometry};
use crate::job::{ConfigError, Job};
use crate::source::{open_image, RawStream};
use crate::writer::ContainerWriter;

use super::{discard, scheduler, Event, JobError, Outcome, Pipeline, Progress};

/// Read granularity when the input is a raw image.
const RAW_READ_SIZE: u32 = 1 << 16;

pub(super) fn run(
    pipeline: &Pipeline,
    id:       usize,
    job:      &Job,
    events:   &Sender<Event>,
) -> Result<Outcome, JobError> {
    let permitted = job.validate()?;
    job.check_distinct_output()?;
    let output = job.output_path()?;

    let source = open_image(&job.input, RAW_READ_SIZE)?;
    let raw_size = source.geometry().raw_size;
    let format = job.format.descriptor();
    let block_size = job.resolve_block_size(raw_size);
    let shift = format.alignment_shift(raw_size, block_size).ok_or(ConfigError::TooLarge {
        format: job.format,
        raw_size,
        block_size,
    })?;
    let geometry = Geometry::new(raw_size, block_size, shift);
    info!(
        format  = %job.format,
        source  = source.variant().map_or("raw", |v| v.name()),
        raw_size,
        block_size,
        shift,
        methods = ?permitted,
        "compressing"
    );

    let config = SelectorConfig {
        permitted,
        orig_cost_percent: job.orig_cost_percent,
        lz4_cost_percent:  job.lz4_cost_percent,
        format,
        geometry,
    };

    let file = File::create(output)?;
    let result = write_container(pipeline, id, RawStream::new(source), file, config, events);
    if result.is_err() {
        discard(output);
    }
    result
}

fn write_container(
    pipeline:   &Pipeline,
    id:         usize,
    mut stream: RawStream,
    file:       File,
    config:     SelectorConfig,
    events:     &Sender<Event>,
) -> Result<Outcome, JobError> {
    let geometry = config.geometry;
    let count = geometry.block_count();
    let block_size = geometry.block_size as usize;
    let mut writer = ContainerWriter::new(file, config.format, geometry)?;
    let mut progress = Progress::new(id, geometry.raw_size, events);
    let mut consumed = 0u64;
    let config = Arc::new(config);

    scheduler::run_ordered(
        pipeline.pool(),
        pipeline.max_in_flight(),
        |index| {
            if index == count {
                return Ok(None);
            }
            // Short last block is zero padded.
            let mut raw = vec![0u8; block_size];
            let expected = geometry.payload_len(index);
            let n = stream.fill(&mut raw[..expected])?;
            if n != expected {
                return Err(FormatError::Truncated(format!("input ends inside block {index}")).into());
            }
            Ok(Some(raw))
        },
        move |index, raw| Ok(encode_block(&config, index, raw)?),
        |index, block| {
            writer.push(&block)?;
            consumed += geometry.payload_len(index) as u64;
            progress.update(consumed, writer.position());
            Ok(())
        },
    )?;

    let (file, written) = writer.finish()?;
    file.sync_all()?;
    debug!(blocks = count, written, "container complete");
    Ok(Outcome::Written { raw_size: geometry.raw_size, written })
}
