// ========================================================================================
//                                SIM file header
// ========================================================================================
//
// SIM files hold a normalised intensity matrix. Only the fixed-size header is read
// here: planners need the sample and probe counts to size their ranges.
//
// Layout (little-endian):
//   magic "sim" (3) | version u8 | sample_name_size u16 | num_samples u32 |
//   num_probes u32 | num_channels u8 | number_format u8

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SIM_MAGIC: &[u8; 3] = b"sim";
pub const SIM_HEADER_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Failed to read SIM file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid SIM data in '{path}' (bad magic number {found:?})")]
    BadMagic { path: PathBuf, found: String },
    #[error("Unknown number format code {code} in '{path}'")]
    UnknownNumberFormat { path: PathBuf, code: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberFormat {
    Float32,
    ScaledInt16,
}

impl NumberFormat {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Float32),
            1 => Some(Self::ScaledInt16),
            _ => None,
        }
    }

    pub fn bytes_per_value(self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::ScaledInt16 => 2,
        }
    }
}

impl fmt::Display for NumberFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float32 => f.write_str("32-bit float"),
            Self::ScaledInt16 => f.write_str("scaled 16-bit int"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimHeader {
    pub version: u8,
    pub sample_name_size: u16,
    pub num_samples: u32,
    pub num_probes: u32,
    pub num_channels: u8,
    pub number_format: NumberFormat,
}

impl SimHeader {
    pub fn read(path: &Path) -> Result<Self, SimError> {
        let io_err = |source| SimError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut header = [0u8; SIM_HEADER_LEN];
        File::open(path)
            .and_then(|mut file| file.read_exact(&mut header))
            .map_err(io_err)?;
        Self::parse(path, &header)
    }

    fn parse(path: &Path, header: &[u8; SIM_HEADER_LEN]) -> Result<Self, SimError> {
        if &header[0..3] != SIM_MAGIC {
            return Err(SimError::BadMagic {
                path: path.to_path_buf(),
                found: String::from_utf8_lossy(&header[0..3]).into_owned(),
            });
        }
        let code = header[15];
        let number_format =
            NumberFormat::from_code(code).ok_or_else(|| SimError::UnknownNumberFormat {
                path: path.to_path_buf(),
                code,
            })?;
        Ok(Self {
            version: header[3],
            sample_name_size: u16::from_le_bytes([header[4], header[5]]),
            num_samples: u32::from_le_bytes([header[6], header[7], header[8], header[9]]),
            num_probes: u32::from_le_bytes([header[10], header[11], header[12], header[13]]),
            num_channels: header[14],
            number_format,
        })
    }

    /// Bytes used by one sample record: its name followed by every probe intensity.
    pub fn record_len(&self) -> u64 {
        self.sample_name_size as u64
            + self.num_probes as u64
                * self.num_channels as u64
                * self.number_format.bytes_per_value() as u64
    }
}

impl fmt::Display for SimHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<sim v{} [{}] {} probes, {} samples, {} channels>",
            self.version, self.number_format, self.num_probes, self.num_samples, self.num_channels
        )
    }
}

#[cfg(test)]
pub(crate) fn encode_header(num_samples: u32, num_probes: u32, number_format: u8) -> Vec<u8> {
    let mut bytes = SIM_MAGIC.to_vec();
    bytes.push(1);
    bytes.extend(60u16.to_le_bytes());
    bytes.extend(num_samples.to_le_bytes());
    bytes.extend(num_probes.to_le_bytes());
    bytes.push(2);
    bytes.push(number_format);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn reads_counts_from_the_header() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("run1.sim");
        let mut bytes = encode_header(96, 300_000, 0);
        bytes.extend([0u8; 32]);
        fs::write(&path, bytes).unwrap();

        let header = SimHeader::read(&path).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.sample_name_size, 60);
        assert_eq!(header.num_samples, 96);
        assert_eq!(header.num_probes, 300_000);
        assert_eq!(header.num_channels, 2);
        assert_eq!(header.number_format, NumberFormat::Float32);
        assert_eq!(header.record_len(), 60 + 300_000 * 2 * 4);
        assert_eq!(
            header.to_string(),
            "<sim v1 [32-bit float] 300000 probes, 96 samples, 2 channels>"
        );
    }

    #[test]
    fn rejects_bad_magic_and_unknown_format() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.sim");

        let mut bytes = encode_header(1, 1, 0);
        bytes[0] = b'x';
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(SimHeader::read(&path), Err(SimError::BadMagic { .. })));

        fs::write(&path, encode_header(1, 1, 7)).unwrap();
        assert!(matches!(
            SimHeader::read(&path),
            Err(SimError::UnknownNumberFormat { code: 7, .. })
        ));
    }

    #[test]
    fn short_file_is_an_io_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("short.sim");
        fs::write(&path, b"sim\x01").unwrap();
        assert!(matches!(SimHeader::read(&path), Err(SimError::Io { .. })));
    }
}
