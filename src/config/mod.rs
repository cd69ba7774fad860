//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{collections::BTreeMap, path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::resolver::{ResolutionPolicy, Strictness};
use crate::cache::CacheConfig;
use crate::domain::opaque_id::{CodecParams, DEFAULT_ALPHABET, DEFAULT_MIN_LENGTH, OpaqueIdCodec};
use crate::domain::operators::{OperatorKind, OperatorSet};
use crate::domain::schema::{EntitySchema, FieldKind, FieldSpec, RelationSpec, SchemaRegistry};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "sifter";
const ENV_PREFIX: &str = "SIFTER";

/// Command-line arguments for the sifter binary.
#[derive(Debug, Parser)]
#[command(name = "sifter", version, about = "Inspect filter grammars, predicates and cache keys")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SIFTER_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Resolve a query string against an entity and print the plan.
    Inspect(InspectArgs),
    /// Encode an integer identifier as an opaque token.
    Encode(EncodeArgs),
    /// Decode an opaque token back to its integer identifier.
    Decode(DecodeArgs),
    /// Validate the configuration and list the configured entities.
    Check,
}

#[derive(Debug, Args, Clone)]
pub struct InspectArgs {
    /// Entity to query.
    #[arg(long, value_name = "NAME")]
    pub entity: String,

    /// Request query string, e.g. `filter=status:active&orderBy=name`.
    #[arg(long, value_name = "QUERY", default_value = "")]
    pub query: String,

    /// Plan a paginated read of this page.
    #[arg(long, value_name = "PAGE", conflicts_with = "find")]
    pub page: Option<u64>,

    /// Page size for `--page`.
    #[arg(long = "per-page", value_name = "COUNT", requires = "page")]
    pub per_page: Option<u64>,

    /// Plan a single-record lookup by opaque token.
    #[arg(long, value_name = "TOKEN")]
    pub find: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct EncodeArgs {
    pub id: u64,
}

#[derive(Debug, Args, Clone)]
pub struct DecodeArgs {
    pub token: String,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub codec: CodecParams,
    pub resolution: ResolutionPolicy,
    pub cache: CacheConfig,
    pub entities: SchemaRegistry,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl LoadError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_cli_overrides(cli);

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

impl Settings {
    /// Settings from a single TOML document, without files or environment.
    pub fn from_toml_str(source: &str) -> Result<Self, LoadError> {
        let raw: RawSettings = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            codec,
            resolution,
            cache,
            entities,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            codec: build_codec_settings(codec)?,
            resolution: build_resolution_policy(resolution),
            cache: build_cache_config(cache)?,
            entities: build_entities(entities)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_codec_settings(codec: RawCodecSettings) -> Result<CodecParams, LoadError> {
    let salt = codec.salt.unwrap_or_default();
    if salt.trim().is_empty() {
        return Err(LoadError::invalid("codec.salt", "must be set"));
    }
    let params = CodecParams {
        salt,
        min_length: codec.min_length.unwrap_or(DEFAULT_MIN_LENGTH),
        alphabet: codec
            .alphabet
            .unwrap_or_else(|| DEFAULT_ALPHABET.to_string()),
    };
    // Reject an unusable alphabet at startup rather than on first request.
    OpaqueIdCodec::new(&params).map_err(|err| LoadError::invalid("codec", err.to_string()))?;
    Ok(params)
}

fn build_resolution_policy(resolution: RawResolutionSettings) -> ResolutionPolicy {
    ResolutionPolicy {
        unknown_fields: resolution.unknown_fields.unwrap_or_default(),
        identifier_decode: resolution.identifier_decode.unwrap_or_default(),
        accepted_operators: resolution
            .operators
            .map(|operators| operators.into_iter().collect())
            .unwrap_or_else(OperatorSet::all),
    }
}

fn build_cache_config(cache: CacheConfig) -> Result<CacheConfig, LoadError> {
    if cache.prefix.trim().is_empty() || cache.prefix.contains(':') {
        return Err(LoadError::invalid(
            "cache.prefix",
            "must be non-empty and must not contain `:`",
        ));
    }
    if cache.lock_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.lock_timeout_ms",
            "must be greater than zero",
        ));
    }
    if cache.capacity == 0 {
        return Err(LoadError::invalid("cache.capacity", "must be greater than zero"));
    }
    Ok(cache)
}

fn build_entities(entities: BTreeMap<String, RawEntity>) -> Result<SchemaRegistry, LoadError> {
    let mut registry = SchemaRegistry::new();
    for (name, entity) in entities {
        let key = format!("entities.{name}");
        let fields = build_fields(entity.fields);
        let relations = build_relations(entity.relations);
        let schema = EntitySchema::compile(name, entity.primary_key, fields, relations)
            .map_err(|err| LoadError::invalid(key, err.to_string()))?;
        registry.insert(schema);
    }
    Ok(registry)
}

fn build_fields(fields: BTreeMap<String, RawField>) -> BTreeMap<String, FieldSpec> {
    fields
        .into_iter()
        .map(|(name, field)| {
            let defaults = FieldSpec::default();
            let spec = FieldSpec {
                kind: field.kind.unwrap_or(defaults.kind),
                default_operator: field.default_operator.unwrap_or(defaults.default_operator),
                allowed_operators: field
                    .allowed_operators
                    .map(|operators| operators.into_iter().collect())
                    .unwrap_or(defaults.allowed_operators),
                identifier: field.identifier.unwrap_or(defaults.identifier),
            };
            (name, spec)
        })
        .collect()
}

fn build_relations(relations: BTreeMap<String, RawRelation>) -> BTreeMap<String, RelationSpec> {
    relations
        .into_iter()
        .map(|(name, relation)| {
            let spec = RelationSpec {
                includable: relation.includable,
                searchable: relation.searchable,
                countable: relation.countable,
                fields: build_fields(relation.fields),
                relations: build_relations(relation.relations),
            };
            (name, spec)
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawSettings {
    logging: RawLoggingSettings,
    codec: RawCodecSettings,
    resolution: RawResolutionSettings,
    cache: CacheConfig,
    entities: BTreeMap<String, RawEntity>,
}

impl RawSettings {
    fn apply_cli_overrides(&mut self, cli: &CliArgs) {
        if let Some(level) = cli.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = cli.log_json {
            self.logging.json = Some(json);
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawCodecSettings {
    salt: Option<String>,
    min_length: Option<usize>,
    alphabet: Option<String>,
}

impl std::fmt::Debug for RawCodecSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawCodecSettings")
            .field("salt", &self.salt.as_ref().map(|_| "<redacted>"))
            .field("min_length", &self.min_length)
            .field("alphabet", &self.alphabet)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawResolutionSettings {
    unknown_fields: Option<Strictness>,
    identifier_decode: Option<Strictness>,
    operators: Option<Vec<OperatorKind>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawEntity {
    primary_key: Option<String>,
    fields: BTreeMap<String, RawField>,
    relations: BTreeMap<String, RawRelation>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawField {
    #[serde(rename = "type")]
    kind: Option<FieldKind>,
    default_operator: Option<OperatorKind>,
    allowed_operators: Option<Vec<OperatorKind>>,
    identifier: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawRelation {
    includable: bool,
    searchable: bool,
    countable: bool,
    fields: BTreeMap<String, RawField>,
    relations: BTreeMap<String, RawRelation>,
}
