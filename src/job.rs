//! Job descriptions and their up-front validation.
//!
//! Everything that can be checked without reading image data is checked
//! here, so a misconfigured job fails before its first block is scheduled.

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::codec::{Method, MethodSet};
use crate::format::{ContainerFormat, FormatVariant};

// ── Constants ────────────────────────────────────────────────────────────────

/// Block size for images smaller than [`LARGE_IMAGE_THRESHOLD`].
pub const DEFAULT_BLOCK_SIZE: u32 = 2048;
/// Block size for images of at least [`LARGE_IMAGE_THRESHOLD`] bytes.
pub const LARGE_BLOCK_SIZE: u32 = 16384;
pub const LARGE_IMAGE_THRESHOLD: u64 = 2 << 30;
pub const MIN_BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 1 << 24;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("no compression method is permitted for {format}")]
    NoMethods { format: FormatVariant },
    #[error("block size {0} must be a power of two between 512 and 16 MiB")]
    InvalidBlockSize(u32),
    #[error("{format} requires a block size of {required}, got {requested}")]
    FixedBlockSize { format: FormatVariant, required: u32, requested: u32 },
    #[error("a {raw_size}-byte image cannot be stored as {format} with {block_size}-byte blocks")]
    TooLarge { format: FormatVariant, raw_size: u64, block_size: u32 },
    #[error("{name} cost must be a non-negative percentage, got {value}")]
    InvalidCost { name: &'static str, value: f64 },
    #[error("no output path given for {}", .0.display())]
    MissingOutput(PathBuf),
    #[error("output {} would overwrite the input", .0.display())]
    OutputIsInput(PathBuf),
}

// ── Modes and codec flags ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Compress,
    Decompress,
    /// Decode the image and report its CRC32 without writing anything.
    Checksum,
}

/// User-level method selection.  See [`CodecFlags::resolve`] for the rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodecFlags {
    /// Re-enable methods a format disables by default.
    pub enable:  MethodSet,
    /// Disable methods.
    pub disable: MethodSet,
    /// When non-empty, only these methods (minus `disable`) are tried.
    pub only:    MethodSet,
    /// Drop every exhaustive tier.
    pub fast:    bool,
}

impl CodecFlags {
    /// Methods a variant leaves off unless explicitly enabled.
    pub fn format_defaults(variant: FormatVariant) -> MethodSet {
        let lz4_brute = MethodSet::single(Method::Lz4HcBrute);
        let zopfli = MethodSet::single(Method::Zopfli);
        match variant {
            FormatVariant::Cso2 => zopfli.union(lz4_brute),
            FormatVariant::Zso  => MethodSet::DEFLATE.union(lz4_brute),
            FormatVariant::Cso1 | FormatVariant::Dax => zopfli.union(MethodSet::LZ4),
        }
    }

    /// Methods removed by `fast`.
    pub fn slow_methods() -> MethodSet {
        [Method::ZlibBrute, Method::Zopfli, Method::Deflate7z, Method::Lz4Hc, Method::Lz4HcBrute]
            .into_iter()
            .collect()
    }

    /// Resolve the permitted set for one container format.
    ///
    /// Without `only`, the format defaults are disabled (less `enable`);
    /// with it, exactly `only` is considered.  Then `disable` and `fast`
    /// remove methods, and methods the format cannot store or this build
    /// lacks are dropped.
    pub fn resolve(&self, format: &dyn ContainerFormat) -> Result<MethodSet, ConfigError> {
        let variant = format.variant();
        let mut permitted = if self.only.is_empty() {
            MethodSet::ALL.difference(Self::format_defaults(variant).difference(self.enable))
        } else {
            self.only
        };
        permitted = permitted.difference(self.disable);
        if self.fast {
            permitted = permitted.difference(Self::slow_methods());
        }
        let permitted: MethodSet = permitted
            .iter()
            .filter(|m| m.is_available() && format.supports(m.family()))
            .collect();
        if permitted.is_empty() {
            return Err(ConfigError::NoMethods { format: variant });
        }
        Ok(permitted)
    }
}

// ── Job ──────────────────────────────────────────────────────────────────────

/// One unit of work: an input path, an output path and how to get there.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub input:             PathBuf,
    /// Required for compress and decompress, ignored for checksum.
    pub output:            Option<PathBuf>,
    pub mode:              Mode,
    pub format:            FormatVariant,
    /// `None` picks a size from the image size (or the format's fixed size).
    pub block_size:        Option<u32>,
    pub codecs:            CodecFlags,
    /// Store a block raw when it is at most this many percent larger than
    /// the best compressed result.  Zero disables.
    pub orig_cost_percent: f64,
    /// Prefer LZ4 when it is at most this many percent larger than the best
    /// result.  Zero disables.
    pub lz4_cost_percent:  f64,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            input:             PathBuf::new(),
            output:            None,
            mode:              Mode::Compress,
            format:            FormatVariant::Cso1,
            block_size:        None,
            codecs:            CodecFlags::default(),
            orig_cost_percent: 0.0,
            lz4_cost_percent:  0.0,
        }
    }
}

impl Job {
    pub fn compress(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self { input: input.into(), output: Some(output.into()), ..Self::default() }
    }

    pub fn decompress(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input:  input.into(),
            output: Some(output.into()),
            mode:   Mode::Decompress,
            ..Self::default()
        }
    }

    pub fn checksum(input: impl Into<PathBuf>) -> Self {
        Self { input: input.into(), mode: Mode::Checksum, ..Self::default() }
    }

    pub fn with_format(mut self, format: FormatVariant) -> Self {
        self.format = format;
        self
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn with_codecs(mut self, codecs: CodecFlags) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_costs(mut self, orig_cost_percent: f64, lz4_cost_percent: f64) -> Self {
        self.orig_cost_percent = orig_cost_percent;
        self.lz4_cost_percent = lz4_cost_percent;
        self
    }

    /// Output path, required for every mode that writes.
    pub fn output_path(&self) -> Result<&Path, ConfigError> {
        self.output
            .as_deref()
            .ok_or_else(|| ConfigError::MissingOutput(self.input.clone()))
    }

    /// Fail when the output resolves to the input file.
    pub fn check_distinct_output(&self) -> Result<(), ConfigError> {
        let output = self.output_path()?;
        match (self.input.canonicalize(), output.canonicalize()) {
            (Ok(a), Ok(b)) if a == b => Err(ConfigError::OutputIsInput(output.to_path_buf())),
            _ => Ok(()),
        }
    }

    /// Checks that need no knowledge of the image.  Returns the permitted
    /// method set for compress jobs.
    pub fn validate(&self) -> Result<MethodSet, ConfigError> {
        if self.mode != Mode::Checksum {
            self.output_path()?;
        }
        if let Some(bs) = self.block_size {
            if !bs.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&bs) {
                return Err(ConfigError::InvalidBlockSize(bs));
            }
        }
        if self.mode != Mode::Compress {
            return Ok(MethodSet::EMPTY);
        }
        for (name, value) in [("orig", self.orig_cost_percent), ("lz4", self.lz4_cost_percent)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidCost { name, value });
            }
        }
        let format = self.format.descriptor();
        if let (Some(required), Some(requested)) = (format.fixed_block_size(), self.block_size) {
            if required != requested {
                return Err(ConfigError::FixedBlockSize { format: self.format, required, requested });
            }
        }
        self.codecs.resolve(format)
    }

    /// Block size for a compress job over an image of `raw_size` bytes.
    pub fn resolve_block_size(&self, raw_size: u64) -> u32 {
        if let Some(fixed) = self.format.descriptor().fixed_block_size() {
            return fixed;
        }
        self.block_size.unwrap_or(if raw_size >= LARGE_IMAGE_THRESHOLD {
            LARGE_BLOCK_SIZE
        } else {
            DEFAULT_BLOCK_SIZE
        })
    }
}
