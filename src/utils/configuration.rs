use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Configuration for the whole AptaForge pipeline
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AptaForgeConfig {
    /// General experiment settings
    pub general: GeneralConfig,
    /// Demultiplexing / parsing settings
    pub parser: ParserConfig,
    /// Selection cycles of the experiment, in file order
    pub cycles: Vec<CycleConfig>,
    /// Bloom filter sizing
    pub bloom: BloomConfig,
    /// Structure prediction settings
    pub structure: StructureConfig,
    /// Performance and resource settings
    pub performance: PerformanceConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Experiment name
    pub name: String,
    /// Project directory holding pooldata/, cycledata/ and structuredata/
    pub project_path: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: "experiment".to_string(),
            project_path: PathBuf::from("./aptaforge-project"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Forward read files, processed in order
    pub forward_files: Vec<PathBuf>,
    /// Reverse read files; empty for single-end runs, otherwise paired
    /// with the forward files by index
    pub reverse_files: Vec<PathBuf>,
    /// Reader backend ("fastq" or "fasta")
    pub reader: String,
    /// Assign each file's reads to the cycle of the same index instead of
    /// demultiplexing by barcode
    pub is_per_file: bool,
    /// 5' primer sequence
    pub primer5: String,
    /// 3' primer sequence
    pub primer3: String,
    /// Minimum mate-pair overlap for stitching
    pub min_overlap: usize,
    /// Maximum mismatch rate inside the stitching overlap
    pub max_mismatch_rate: f64,
    /// Mismatches allowed when anchoring primers
    pub tolerance: usize,
    /// Mismatches allowed when matching barcodes
    pub barcode_tolerance: usize,
    /// The 5' primer must start within this many leading bases
    pub max_leading: usize,
    /// The 3' primer must end within this many trailing bases
    pub max_trailing: usize,
    /// Admissible randomized-region length range
    pub min_randomized: usize,
    pub max_randomized: usize,
    /// Minimum mean phred over the randomized region
    pub min_mean_quality: f64,
    /// Capacity of the producer/consumer queue
    pub queue_capacity: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            forward_files: Vec::new(),
            reverse_files: Vec::new(),
            reader: "fastq".to_string(),
            is_per_file: false,
            primer5: String::new(),
            primer3: String::new(),
            min_overlap: 10,
            max_mismatch_rate: 0.1,
            tolerance: 2,
            barcode_tolerance: 1,
            max_leading: 25,
            max_trailing: 25,
            min_randomized: 10,
            max_randomized: 120,
            min_mean_quality: 20.0,
            queue_capacity: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    pub name: String,
    pub round: usize,
    #[serde(default)]
    pub barcode5: Option<String>,
    #[serde(default)]
    pub barcode3: Option<String>,
    #[serde(default)]
    pub is_control: bool,
    #[serde(default)]
    pub is_counter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BloomConfig {
    /// Expected number of distinct aptamers
    pub capacity: usize,
    /// Target false-positive rate while within capacity
    pub fp_rate: f64,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000_000,
            fp_rate: 0.001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureConfig {
    /// Maximum base-pair span of the partition function band
    pub max_span: usize,
    /// Folding temperature in degrees Celsius
    pub temperature: f64,
    /// Capacity of the prediction queue
    pub queue_capacity: usize,
    /// Persist predicted profiles to structuredata/
    pub persist_profiles: bool,
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            max_span: 100,
            temperature: 37.0,
            queue_capacity: 500,
            persist_profiles: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Upper bound on worker threads; the drivers use
    /// min(available cores, max_threads)
    pub max_threads: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_threads: num_cpus::get(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log output format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Configuration and validation errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Input/Output error: {message}")]
    IOError { message: String },

    #[error("Validation error: {field} is invalid: {reason}")]
    ValidationError { field: String, reason: String },
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        PipelineError::ConfigurationError {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::IOError {
            message: err.to_string(),
        }
    }
}

/// Loads, validates and hands out the pipeline configuration.
pub struct ConfigurationManager {
    config: AptaForgeConfig,
    config_path: Option<PathBuf>,
}

impl ConfigurationManager {
    /// Pure defaults, no file dependencies.
    pub fn new_with_defaults() -> Result<Self, PipelineError> {
        let manager = Self {
            config: AptaForgeConfig::default(),
            config_path: None,
        };
        manager.validate_configuration()?;
        manager.setup_logging()?;
        Ok(manager)
    }

    /// Load configuration from a specific TOML file, with environment
    /// overrides applied on top.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, PipelineError> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = Self::load_config_from_file(&config_path)?;

        let manager = Self {
            config,
            config_path: Some(config_path),
        };
        manager.validate_configuration()?;
        manager.setup_logging()?;
        Ok(manager)
    }

    /// Load configuration from the default locations: an optional
    /// `./config/default.toml`, a user config under the home directory,
    /// and `APTA__`-prefixed environment variables.
    pub fn load_from_default_locations() -> Result<Self, PipelineError> {
        let mut builder = Config::builder();

        if let Ok(embedded) = std::fs::read_to_string("./config/default.toml") {
            builder = builder.add_source(File::from_str(&embedded, FileFormat::Toml));
        } else {
            info!("no config/default.toml found, using built-in defaults");
        }

        if let Ok(system_config) = env::var("APTA_SYSTEM_CONFIG") {
            builder = builder.add_source(File::with_name(&system_config).required(false));
        }

        if let Some(home_dir) = dirs::home_dir() {
            let user_config = home_dir.join(".config").join("aptaforge").join("config.toml");
            builder = builder.add_source(File::from(user_config).required(false));
        }

        builder = builder.add_source(Environment::with_prefix("APTA").separator("__"));

        let config = match builder.build() {
            Ok(built) => match built.try_deserialize() {
                Ok(config) => config,
                Err(e) => {
                    warn!("failed to deserialize configuration: {e}, using built-in defaults");
                    AptaForgeConfig::default()
                }
            },
            Err(e) => {
                warn!("failed to build configuration: {e}, using built-in defaults");
                AptaForgeConfig::default()
            }
        };

        let manager = Self {
            config,
            config_path: None,
        };
        manager.validate_configuration()?;
        manager.setup_logging()?;
        Ok(manager)
    }

    fn load_config_from_file(path: &Path) -> Result<AptaForgeConfig, PipelineError> {
        let builder = Config::builder()
            .add_source(File::from(path.to_path_buf()))
            .add_source(Environment::with_prefix("APTA").separator("__"));

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate_configuration(&self) -> Result<(), PipelineError> {
        let config = &self.config;

        if config.parser.min_randomized > config.parser.max_randomized {
            return Err(PipelineError::ValidationError {
                field: "parser.min_randomized".to_string(),
                reason: format!(
                    "must not exceed max_randomized ({} > {})",
                    config.parser.min_randomized, config.parser.max_randomized
                ),
            });
        }

        if !(0.0..=1.0).contains(&config.parser.max_mismatch_rate) {
            return Err(PipelineError::ValidationError {
                field: "parser.max_mismatch_rate".to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }

        if config.parser.min_overlap == 0 {
            return Err(PipelineError::ValidationError {
                field: "parser.min_overlap".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        if !(config.bloom.fp_rate > 0.0 && config.bloom.fp_rate < 1.0) {
            return Err(PipelineError::ValidationError {
                field: "bloom.fp_rate".to_string(),
                reason: "must be within (0, 1)".to_string(),
            });
        }

        if config.structure.max_span < 4 {
            return Err(PipelineError::ValidationError {
                field: "structure.max_span".to_string(),
                reason: "must be at least 4".to_string(),
            });
        }

        if config.performance.max_threads == 0 {
            return Err(PipelineError::ValidationError {
                field: "performance.max_threads".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        for cycle in &config.cycles {
            if cycle.name.is_empty() {
                return Err(PipelineError::ValidationError {
                    field: "cycles.name".to_string(),
                    reason: "cycle names must be non-empty".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Install the tracing subscriber according to the logging section.
    /// Safe to call more than once; later calls keep the first subscriber.
    pub fn setup_logging(&self) -> Result<(), PipelineError> {
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.config.logging.level.clone()));

        let result = if self.config.logging.format == "pretty" {
            tracing_subscriber::fmt().with_env_filter(filter).pretty().try_init()
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).compact().try_init()
        };

        // A subscriber installed by the embedding application wins.
        if result.is_err() {
            info!("tracing subscriber already installed, keeping existing one");
        }
        Ok(())
    }

    pub fn config(&self) -> &AptaForgeConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut AptaForgeConfig {
        &mut self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration_is_valid() {
        let manager = ConfigurationManager {
            config: AptaForgeConfig::default(),
            config_path: None,
        };
        assert!(manager.validate_configuration().is_ok());
    }

    #[test]
    fn test_invalid_randomized_range_is_rejected() {
        let mut config = AptaForgeConfig::default();
        config.parser.min_randomized = 50;
        config.parser.max_randomized = 10;

        let manager = ConfigurationManager {
            config,
            config_path: None,
        };
        assert!(matches!(
            manager.validate_configuration(),
            Err(PipelineError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_invalid_fp_rate_is_rejected() {
        let mut config = AptaForgeConfig::default();
        config.bloom.fp_rate = 0.0;

        let manager = ConfigurationManager {
            config,
            config_path: None,
        };
        assert!(manager.validate_configuration().is_err());
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[general]
name = "selex-run-3"
project_path = "/tmp/selex3"

[parser]
primer5 = "GGGAGG"
primer3 = "CCTCCC"
min_overlap = 12

[[cycles]]
name = "R1"
round = 1
barcode5 = "AT"
barcode3 = "GC"
"#,
        )
        .unwrap();

        let manager = ConfigurationManager::from_file(&path).unwrap();
        let config = manager.config();
        assert_eq!(config.general.name, "selex-run-3");
        assert_eq!(config.parser.primer5, "GGGAGG");
        assert_eq!(config.parser.min_overlap, 12);
        assert_eq!(config.cycles.len(), 1);
        assert_eq!(config.cycles[0].barcode5.as_deref(), Some("AT"));
        // Unset fields keep their defaults.
        assert_eq!(config.parser.queue_capacity, 500);
    }
}
