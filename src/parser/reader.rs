//! Sequencing file readers
//!
//! Stream-oriented FASTQ and FASTA readers over forward and optional
//! reverse files. Gzip compression is detected from the magic bytes at
//! open time, falling back to plain reads when the header does not
//! match; the file name plays no role in compression detection.

use anyhow::{bail, Context, Result};
use bio::io::{fasta, fastq};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufReader, Read as IoRead, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::core::data_structures::{FileFormat, SequencingRead};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Default quality assigned to FASTA records, which carry none ('I' = Q40).
const FASTA_DEFAULT_QUALITY: u8 = b'I';

/// A source of sequencing reads. Implementations are single-threaded;
/// the driver gives each reader to exactly one producer.
pub trait Reader: Send {
    /// The next read, or `None` at end of stream.
    fn next_read(&mut self) -> Result<Option<SequencingRead>>;

    /// Release the underlying file handles. Reading past `close` yields
    /// end of stream.
    fn close(&mut self) -> Result<()>;
}

type Input = BufReader<Box<dyn IoRead + Send>>;

/// Open a file, sniffing the gzip magic to pick the decompressor.
fn open_input(path: &Path) -> Result<Input> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open input file {}", path.display()))?;

    let mut magic = [0u8; 2];
    let gzipped = match file.read_exact(&mut magic) {
        Ok(()) => magic == GZIP_MAGIC,
        Err(_) => false, // shorter than two bytes, certainly not gzip
    };
    file.seek(SeekFrom::Start(0))
        .with_context(|| format!("failed to rewind {}", path.display()))?;

    let inner: Box<dyn IoRead + Send> = if gzipped {
        debug!("opened gzip compressed input {}", path.display());
        Box::new(MultiGzDecoder::new(BufReader::new(file)))
    } else {
        debug!("opened plain input {}", path.display());
        Box::new(file)
    };
    Ok(BufReader::new(inner))
}

/// FASTQ reader over a forward file and an optional reverse mate file.
/// `close` drops both record streams; a closed reader reports end of
/// stream.
pub struct FastqReader {
    forward: Option<fastq::Records<Input>>,
    reverse: Option<fastq::Records<Input>>,
    forward_path: PathBuf,
    reverse_path: Option<PathBuf>,
}

impl FastqReader {
    pub fn open(forward: &Path, reverse: Option<&Path>) -> Result<Self> {
        let forward_records = fastq::Reader::from_bufread(open_input(forward)?).records();
        let reverse_records = match reverse {
            Some(path) => Some(fastq::Reader::from_bufread(open_input(path)?).records()),
            None => None,
        };
        Ok(Self {
            forward: Some(forward_records),
            reverse: reverse_records,
            forward_path: forward.to_path_buf(),
            reverse_path: reverse.map(Path::to_path_buf),
        })
    }

    fn next_record(
        records: &mut fastq::Records<Input>,
        path: &Path,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let record = match records.next() {
            None => return Ok(None),
            Some(result) => {
                result.with_context(|| format!("error while parsing {}", path.display()))?
            }
        };
        let sequence = record.seq().to_ascii_uppercase();
        let quality = record.qual().to_vec();
        if sequence.len() != quality.len() {
            bail!(
                "sequence and quality lengths differ ({} vs {}) in record '{}' of {}",
                sequence.len(),
                quality.len(),
                record.id(),
                path.display()
            );
        }
        Ok(Some((sequence, quality)))
    }
}

impl Reader for FastqReader {
    fn next_read(&mut self) -> Result<Option<SequencingRead>> {
        let forward_records = match self.forward.as_mut() {
            None => return Ok(None), // closed
            Some(records) => records,
        };
        let (forward, forward_quality) =
            match Self::next_record(forward_records, &self.forward_path)? {
                None => return Ok(None),
                Some(pair) => pair,
            };

        if let Some(reverse_records) = &mut self.reverse {
            let reverse_path = self.reverse_path.as_deref().unwrap_or(Path::new("?"));
            match Self::next_record(reverse_records, reverse_path)? {
                None => {
                    warn!(
                        "reverse file {} ended before forward file {}, stopping",
                        reverse_path.display(),
                        self.forward_path.display()
                    );
                    Ok(None)
                }
                Some((reverse, reverse_quality)) => Ok(Some(SequencingRead::paired_end(
                    forward,
                    forward_quality,
                    reverse,
                    reverse_quality,
                ))),
            }
        } else {
            Ok(Some(SequencingRead::single_end(forward, forward_quality)))
        }
    }

    fn close(&mut self) -> Result<()> {
        self.forward = None;
        self.reverse = None;
        debug!("closed fastq reader for {}", self.forward_path.display());
        Ok(())
    }
}

/// FASTA reader. Qualities are absent from the format, so records get a
/// uniform default quality string. `close` behaves as for
/// [`FastqReader`].
pub struct FastaReader {
    forward: Option<fasta::Records<Input>>,
    reverse: Option<fasta::Records<Input>>,
    forward_path: PathBuf,
    reverse_path: Option<PathBuf>,
}

impl FastaReader {
    pub fn open(forward: &Path, reverse: Option<&Path>) -> Result<Self> {
        let forward_records = fasta::Reader::from_bufread(open_input(forward)?).records();
        let reverse_records = match reverse {
            Some(path) => Some(fasta::Reader::from_bufread(open_input(path)?).records()),
            None => None,
        };
        Ok(Self {
            forward: Some(forward_records),
            reverse: reverse_records,
            forward_path: forward.to_path_buf(),
            reverse_path: reverse.map(Path::to_path_buf),
        })
    }

    fn next_record(
        records: &mut fasta::Records<Input>,
        path: &Path,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let record = match records.next() {
            None => return Ok(None),
            Some(result) => {
                result.with_context(|| format!("error while parsing {}", path.display()))?
            }
        };
        let sequence = record.seq().to_ascii_uppercase();
        let quality = vec![FASTA_DEFAULT_QUALITY; sequence.len()];
        Ok(Some((sequence, quality)))
    }
}

impl Reader for FastaReader {
    fn next_read(&mut self) -> Result<Option<SequencingRead>> {
        let forward_records = match self.forward.as_mut() {
            None => return Ok(None), // closed
            Some(records) => records,
        };
        let (forward, forward_quality) =
            match Self::next_record(forward_records, &self.forward_path)? {
                None => return Ok(None),
                Some(pair) => pair,
            };

        if let Some(reverse_records) = &mut self.reverse {
            let reverse_path = self.reverse_path.as_deref().unwrap_or(Path::new("?"));
            match Self::next_record(reverse_records, reverse_path)? {
                None => {
                    warn!(
                        "reverse file {} ended before forward file {}, stopping",
                        reverse_path.display(),
                        self.forward_path.display()
                    );
                    Ok(None)
                }
                Some((reverse, reverse_quality)) => Ok(Some(SequencingRead::paired_end(
                    forward,
                    forward_quality,
                    reverse,
                    reverse_quality,
                ))),
            }
        } else {
            Ok(Some(SequencingRead::single_end(forward, forward_quality)))
        }
    }

    fn close(&mut self) -> Result<()> {
        self.forward = None;
        self.reverse = None;
        debug!("closed fasta reader for {}", self.forward_path.display());
        Ok(())
    }
}

/// Instantiate the reader backend named in the configuration. The
/// `auto` backend picks the format from the forward file name.
pub fn create_reader(
    backend: &str,
    forward: &Path,
    reverse: Option<&Path>,
) -> Result<Box<dyn Reader>> {
    match backend.to_ascii_lowercase().as_str() {
        "fastq" => Ok(Box::new(FastqReader::open(forward, reverse)?)),
        "fasta" => Ok(Box::new(FastaReader::open(forward, reverse)?)),
        "auto" => match FileFormat::from_path(forward) {
            FileFormat::Fastq => Ok(Box::new(FastqReader::open(forward, reverse)?)),
            FileFormat::Fasta => Ok(Box::new(FastaReader::open(forward, reverse)?)),
            FileFormat::Unknown => bail!(
                "cannot detect the format of {} from its name",
                forward.display()
            ),
        },
        other => bail!("unknown reader backend '{other}'"),
    }
}
