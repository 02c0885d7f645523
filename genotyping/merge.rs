// ========================================================================================
//
//                               Merge Reassembler
//
// ========================================================================================
//
// Combines per-chunk outputs into one dataset. Chunks are always merged in
// partition-index order, whatever order they are supplied in, and nothing is
// written to the destination unless every chunk output is present and every
// merged file was written in full.

use log::{debug, info};
use memmap2::Mmap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::shared::files::{StagedFile, append_extension, plink_fileset, publish_all};
use crate::types::{ExpectedOutputSet, MergedArtifact};

const PLINK_MAGIC: [u8; 3] = [0x6c, 0x1b, 0x01];
const PLINK_HEADER_LEN: usize = PLINK_MAGIC.len();

/// The axis along which chunk outputs were split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAxis {
    /// Chunks hold disjoint SNPs for the same samples.
    Variants,
    /// Chunks hold disjoint samples for the same SNPs.
    Samples,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeLayout {
    /// `.bed`, `.bim` and `.fam`, in that order, per chunk.
    PlinkTrio(MergeAxis),
    /// One text file per chunk; every chunk after the first drops its header.
    Text { header_lines: usize },
}

/// A chunk whose outputs cannot be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingChunk {
    pub index: usize,
    /// Absent or empty files; empty when no output set was supplied at all.
    pub files: Vec<PathBuf>,
}

impl fmt::Display for MissingChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.files.is_empty() {
            return write!(f, "chunk {} (no outputs supplied)", self.index);
        }
        write!(f, "chunk {} (missing or empty:", self.index)?;
        for path in &self.files {
            write!(f, " {}", path.display())?;
        }
        f.write_str(")")
    }
}

fn join_missing(missing: &[MissingChunk]) -> String {
    missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merge incomplete: {}", join_missing(.missing))]
    Incomplete { missing: Vec<MissingChunk> },
    #[error("no chunk outputs to merge")]
    NoChunks,
    #[error("chunk {0} was supplied more than once")]
    DuplicateChunk(usize),
    #[error("chunk {index} has {found} output files, expected {expected}")]
    Layout {
        index: usize,
        expected: usize,
        found: usize,
    },
    #[error("invalid PLINK data in {path}: {message}")]
    Format { path: PathBuf, message: String },
    #[error("{path} does not match the first chunk: {message}")]
    Mismatch { path: PathBuf, message: String },
    #[error("merge I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MergeError {
    /// Partition indices that must be produced again before merging can succeed.
    pub fn missing_indices(&self) -> Vec<usize> {
        match self {
            Self::Incomplete { missing } => missing.iter().map(|m| m.index).collect(),
            _ => Vec::new(),
        }
    }
}

/// Checks that chunk indices run `0..n` without gaps or repeats and that every
/// expected file is present and non-empty. Returns the chunks in index order.
pub fn verify_chunks(chunks: &[ExpectedOutputSet]) -> Result<Vec<&ExpectedOutputSet>, MergeError> {
    if chunks.is_empty() {
        return Err(MergeError::NoChunks);
    }
    let mut ordered: Vec<&ExpectedOutputSet> = chunks.iter().collect();
    ordered.sort_by_key(|chunk| chunk.index);
    for pair in ordered.windows(2) {
        if pair[0].index == pair[1].index {
            return Err(MergeError::DuplicateChunk(pair[0].index));
        }
    }

    let mut missing = Vec::new();
    let mut expected = 0usize;
    for chunk in &ordered {
        while expected < chunk.index {
            missing.push(MissingChunk {
                index: expected,
                files: Vec::new(),
            });
            expected += 1;
        }
        let absent = chunk.missing_files();
        if !absent.is_empty() {
            missing.push(MissingChunk {
                index: chunk.index,
                files: absent,
            });
        }
        expected = chunk.index + 1;
    }

    if missing.is_empty() {
        Ok(ordered)
    } else {
        Err(MergeError::Incomplete { missing })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MergeReassembler {
    layout: MergeLayout,
}

impl MergeReassembler {
    pub fn new(layout: MergeLayout) -> Self {
        Self { layout }
    }

    /// The files a merge into `destination` produces. For PLINK layouts the
    /// destination names the `.bed` file; the extension is added when absent.
    pub fn destination_files(&self, destination: &Path) -> Vec<PathBuf> {
        match self.layout {
            MergeLayout::PlinkTrio(_) => {
                let bed = if destination.extension().is_some_and(|ext| ext == "bed") {
                    destination.to_path_buf()
                } else {
                    append_extension(destination, "bed")
                };
                plink_fileset(&bed).to_vec()
            }
            MergeLayout::Text { .. } => vec![destination.to_path_buf()],
        }
    }

    pub fn verify<'a>(
        &self,
        chunks: &'a [ExpectedOutputSet],
    ) -> Result<Vec<&'a ExpectedOutputSet>, MergeError> {
        let ordered = verify_chunks(chunks)?;
        let expected = match self.layout {
            MergeLayout::PlinkTrio(_) => 3,
            MergeLayout::Text { .. } => 1,
        };
        for chunk in &ordered {
            if chunk.files.len() != expected {
                return Err(MergeError::Layout {
                    index: chunk.index,
                    expected,
                    found: chunk.files.len(),
                });
            }
        }
        Ok(ordered)
    }

    /// Merges `chunks` into `destination`.
    ///
    /// The first chunk in index order seeds the result and later chunks are
    /// appended to it. A single chunk is copied, so the result always has the
    /// same shape. On any error no destination file is created.
    pub fn reassemble(
        &self,
        chunks: &[ExpectedOutputSet],
        destination: &Path,
    ) -> Result<MergedArtifact, MergeError> {
        let ordered = self.verify(chunks)?;
        let targets = self.destination_files(destination);
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        info!(
            "Merging {} chunk(s) into {}",
            ordered.len(),
            targets[0].display()
        );

        let mut staged = targets
            .iter()
            .map(|target| StagedFile::create(target))
            .collect::<io::Result<Vec<_>>>()?;

        if ordered.len() == 1 {
            for (file, source) in staged.iter_mut().zip(&ordered[0].files) {
                io::copy(&mut File::open(source)?, file.writer()?)?;
            }
        } else {
            match self.layout {
                MergeLayout::PlinkTrio(MergeAxis::Variants) => {
                    merge_plink_variants(&ordered, &mut staged)?
                }
                MergeLayout::PlinkTrio(MergeAxis::Samples) => {
                    merge_plink_samples(&ordered, &mut staged)?
                }
                MergeLayout::Text { header_lines } => {
                    merge_text(&ordered, header_lines, &mut staged[0])?
                }
            }
        }

        let files = publish_all(&mut staged)?;
        Ok(MergedArtifact {
            files,
            chunks_merged: ordered.len(),
        })
    }
}

// ========================================================================================
//                                      Text files
// ========================================================================================

fn merge_text(
    ordered: &[&ExpectedOutputSet],
    header_lines: usize,
    out: &mut StagedFile,
) -> Result<(), MergeError> {
    let writer = out.writer()?;
    let mut line = Vec::new();
    for (position, chunk) in ordered.iter().enumerate() {
        let mut reader = BufReader::new(File::open(&chunk.files[0])?);
        let skip = if position == 0 { 0 } else { header_lines };
        let mut line_no = 0usize;
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            line_no += 1;
            if line_no <= skip {
                continue;
            }
            writer.write_all(&line)?;
            if !line.ends_with(b"\n") {
                writer.write_all(b"\n")?;
            }
        }
    }
    Ok(())
}

// ========================================================================================
//                                    PLINK filesets
// ========================================================================================

/// A memory-mapped chunk `.bed` with its dimensions checked against the
/// accompanying `.bim` and `.fam`.
struct BedChunk {
    mmap: Mmap,
    bytes_per_variant: usize,
    n_samples: usize,
}

impl BedChunk {
    fn open(path: &Path, n_samples: usize, n_variants: usize) -> Result<Self, MergeError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        validate_bed_header(path, &mmap)?;
        let bytes_per_variant = n_samples.div_ceil(4);
        let expected = bytes_per_variant * n_variants;
        let actual = mmap.len() - PLINK_HEADER_LEN;
        if actual != expected {
            return Err(MergeError::Format {
                path: path.to_path_buf(),
                message: format!(
                    "payload is {actual} bytes but {n_variants} variants of {n_samples} samples need {expected}"
                ),
            });
        }
        Ok(Self {
            mmap,
            bytes_per_variant,
            n_samples,
        })
    }

    fn payload(&self) -> &[u8] {
        &self.mmap[PLINK_HEADER_LEN..]
    }

    fn variant(&self, v: usize) -> &[u8] {
        let start = v * self.bytes_per_variant;
        &self.payload()[start..start + self.bytes_per_variant]
    }
}

fn validate_bed_header(path: &Path, bytes: &[u8]) -> Result<(), MergeError> {
    let message = match bytes {
        [0x6c, 0x1b, 0x01, ..] => return Ok(()),
        [0x6c, 0x1b, mode, ..] => {
            format!("unsupported mode byte {mode:#04x} (only variant-major mode is supported)")
        }
        _ => "missing PLINK magic bytes 0x6c 0x1b".to_string(),
    };
    Err(MergeError::Format {
        path: path.to_path_buf(),
        message,
    })
}

fn count_records(bytes: &[u8]) -> usize {
    bytes
        .split(|&b| b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .count()
}

fn write_lines(writer: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes)?;
    if !bytes.is_empty() && !bytes.ends_with(b"\n") {
        writer.write_all(b"\n")?;
    }
    Ok(())
}

/// Chunks split the SNPs: sample lists must agree, variant blocks are appended.
fn merge_plink_variants(
    ordered: &[&ExpectedOutputSet],
    staged: &mut [StagedFile],
) -> Result<(), MergeError> {
    let fam = fs::read(&ordered[0].files[2])?;
    let n_samples = count_records(&fam);

    staged[0].writer()?.write_all(&PLINK_MAGIC)?;
    for chunk in ordered {
        let [bed_path, bim_path, fam_path] = [&chunk.files[0], &chunk.files[1], &chunk.files[2]];
        if chunk.index != ordered[0].index && fs::read(fam_path)? != fam {
            return Err(MergeError::Mismatch {
                path: fam_path.clone(),
                message: "sample records differ".to_string(),
            });
        }
        let bim = fs::read(bim_path)?;
        let bed = BedChunk::open(bed_path, n_samples, count_records(&bim))?;
        debug!(
            "Appending chunk {} ({} variants)",
            chunk.index,
            count_records(&bim)
        );
        staged[0].writer()?.write_all(bed.payload())?;
        write_lines(staged[1].writer()?, &bim)?;
    }
    write_lines(staged[2].writer()?, &fam)?;
    Ok(())
}

/// Chunks split the samples: variant lists must agree, and every variant block
/// is re-packed from the chunks' 2-bit genotype codes.
fn merge_plink_samples(
    ordered: &[&ExpectedOutputSet],
    staged: &mut [StagedFile],
) -> Result<(), MergeError> {
    let bim = fs::read(&ordered[0].files[1])?;
    let n_variants = count_records(&bim);

    let mut beds = Vec::with_capacity(ordered.len());
    for chunk in ordered {
        let [bed_path, bim_path, fam_path] = [&chunk.files[0], &chunk.files[1], &chunk.files[2]];
        if chunk.index != ordered[0].index && fs::read(bim_path)? != bim {
            return Err(MergeError::Mismatch {
                path: bim_path.clone(),
                message: "variant records differ".to_string(),
            });
        }
        let fam = fs::read(fam_path)?;
        beds.push(BedChunk::open(bed_path, count_records(&fam), n_variants)?);
        write_lines(staged[2].writer()?, &fam)?;
    }
    write_lines(staged[1].writer()?, &bim)?;

    let total_samples: usize = beds.iter().map(|bed| bed.n_samples).sum();
    let mut block = vec![0u8; total_samples.div_ceil(4)];
    let writer = staged[0].writer()?;
    writer.write_all(&PLINK_MAGIC)?;
    for v in 0..n_variants {
        block.fill(0);
        let mut offset = 0usize;
        for bed in &beds {
            repack_codes(bed.variant(v), bed.n_samples, &mut block, offset);
            offset += bed.n_samples;
        }
        writer.write_all(&block)?;
    }
    Ok(())
}

/// Copies `n` 2-bit codes from `src` into `dst` starting at code position `offset`.
/// `dst` must be zeroed at the target positions.
fn repack_codes(src: &[u8], n: usize, dst: &mut [u8], offset: usize) {
    if offset % 4 == 0 {
        let start = offset / 4;
        let full = n / 4;
        dst[start..start + full].copy_from_slice(&src[..full]);
        let rest = n % 4;
        if rest > 0 {
            let mask = (1u8 << (2 * rest)) - 1;
            dst[start + full] |= src[full] & mask;
        }
        return;
    }
    for s in 0..n {
        let code = (src[s / 4] >> (2 * (s % 4))) & 0b11;
        let d = offset + s;
        dst[d / 4] |= code << (2 * (d % 4));
    }
}
