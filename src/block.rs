use tracing::{trace, warn};

use crate::codec::{self, BlockMethod, CodecError, Family, Method, MethodSet};
use crate::format::{ContainerFormat, Geometry};

/// Per-job inputs of the block selector, resolved once before the first block.
#[derive(Clone)]
pub struct SelectorConfig {
    pub permitted:         MethodSet,
    pub orig_cost_percent: f64,
    pub lz4_cost_percent:  f64,
    pub format:            &'static dyn ContainerFormat,
    pub geometry:          Geometry,
}

/// Winning representation of one block, handed from a worker to the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockResult {
    pub index:   u64,
    pub method:  BlockMethod,
    pub payload: Vec<u8>,
}

impl BlockResult {
    pub fn family(&self) -> Family {
        self.method.family()
    }
}

/// Size of one successful trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trial {
    pub method: Method,
    pub size:   usize,
}

/// Pick the representation for a block of `raw_len` bytes: the position of
/// the winning trial, or `None` to store the block raw.
///
/// The smallest trial wins (exact ties go to the cheaper decoder) unless a
/// cost threshold makes a faster representation eligible: raw when it is at
/// most `orig_cost_percent` larger than the best result, otherwise the
/// smallest LZ4 trial when it is at most `lz4_cost_percent` larger.  A zero
/// threshold disables its relaxation.
pub fn choose(
    trials:            &[Trial],
    raw_len:           usize,
    orig_cost_percent: f64,
    lz4_cost_percent:  f64,
) -> Option<usize> {
    let smallest = |family: Option<Family>| {
        trials
            .iter()
            .enumerate()
            .filter(|(_, t)| family.map_or(true, |f| t.method.family() == f))
            .min_by_key(|(_, t)| (t.size, t.method.decode_rank()))
    };
    let (best_at, best) = smallest(None)?;
    let allowance = |percent: f64| best.size as f64 * (1.0 + percent / 100.0);

    if orig_cost_percent > 0.0 && raw_len as f64 <= allowance(orig_cost_percent) {
        return None;
    }
    if lz4_cost_percent > 0.0 {
        if let Some((at, lz4)) = smallest(Some(Family::Lz4)) {
            if lz4.size as f64 <= allowance(lz4_cost_percent) {
                return Some(at);
            }
        }
    }
    Some(best_at)
}

/// Run every permitted trial on `raw` (one full, zero-padded block) and
/// return the winner.
///
/// Trials that do not shrink the block, or whose output the container cannot
/// store, simply lose.  A trial that errors is logged and loses as well; only
/// when every trial errored does the block fail.
pub fn encode_block(cfg: &SelectorConfig, index: u64, raw: Vec<u8>) -> Result<BlockResult, CodecError> {
    let framing = cfg.format.framing();
    let mut outputs: Vec<(Method, Vec<u8>)> = Vec::with_capacity(cfg.permitted.len());
    let mut lost = 0usize;
    let mut last_error = None;

    for method in cfg.permitted.iter() {
        match codec::encode(method, &raw, framing) {
            Ok(Some(out)) if cfg.format.accepts(method.family(), out.len(), &cfg.geometry) => {
                outputs.push((method, out));
            }
            Ok(_) => lost += 1,
            Err(e) => {
                warn!(block = index, %method, error = %e, "compression trial failed");
                last_error = Some(e);
            }
        }
    }
    if outputs.is_empty() && lost == 0 {
        if let Some(e) = last_error {
            return Err(e);
        }
    }

    let trials: Vec<Trial> = outputs
        .iter()
        .map(|(method, out)| Trial { method: *method, size: out.len() })
        .collect();
    let (method, payload) = match choose(&trials, raw.len(), cfg.orig_cost_percent, cfg.lz4_cost_percent) {
        None => (BlockMethod::Raw, raw),
        Some(at) => {
            let (winner, out) = outputs.swap_remove(at);
            (BlockMethod::Coded(winner), out)
        }
    };
    trace!(block = index, method = method.name(), trials = trials.len(), "block selected");
    Ok(BlockResult { index, method, payload })
}
