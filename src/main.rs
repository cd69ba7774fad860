use std::{
    io::{self, Write},
    process,
    sync::Arc,
};

use serde::Serialize;
use sifter::{
    application::{
        catalog::Catalog,
        error::RequestError,
        repos::{EngineError, Page, Pagination, QueryEngine, QuerySpec},
        request::QueryParams,
    },
    cache::CacheOperation,
    config::{self, Command, InspectArgs},
    domain::error::DomainError,
    infra::{error::InfraError, telemetry},
};
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("request rejected: {0}")]
    Request(#[from] RequestError),
    #[error("failed to write output: {0}")]
    Output(#[from] serde_json::Error),
}

/// Planning never reaches an engine; inspection only needs the query shape.
struct PlanOnly;

impl QueryEngine for PlanOnly {
    type Row = serde_json::Value;

    fn fetch(&self, _query: &QuerySpec) -> Result<Vec<Self::Row>, EngineError> {
        Err(EngineError::backend("inspection does not execute queries"))
    }

    fn paginate(
        &self,
        _query: &QuerySpec,
        _pagination: Pagination,
    ) -> Result<Page<Self::Row>, EngineError> {
        Err(EngineError::backend("inspection does not execute queries"))
    }
}

fn main() {
    if let Err(error) = run() {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &CliError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "command failed");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "command failed");
    });
}

fn run() -> Result<(), CliError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let catalog = Catalog::from_settings(&settings)?;
    info!(entities = catalog.schemas().len(), "Configuration loaded");

    match cli_args.command {
        Command::Inspect(args) => run_inspect(&catalog, &args),
        Command::Encode(args) => emit(&EncodeOutput {
            id: args.id,
            token: catalog.codec().encode(args.id),
        }),
        Command::Decode(args) => {
            let id = catalog
                .codec()
                .decode(&args.token)
                .map_err(|_| RequestError::identifier_decode("token", &args.token))?;
            emit(&EncodeOutput {
                id,
                token: args.token,
            })
        }
        Command::Check => emit(&CheckOutput {
            entities: catalog.schemas().names().map(str::to_string).collect(),
            cache_enabled: catalog.coordinator().is_some(),
        }),
    }
}

fn run_inspect(catalog: &Catalog, args: &InspectArgs) -> Result<(), CliError> {
    let mut repository = catalog.repository(&args.entity, Arc::new(PlanOnly))?;

    let operation = match (&args.find, args.page) {
        (Some(token), _) => {
            let resolver = repository.resolver();
            let id = resolver.decode_identifier(resolver.schema().primary_key(), token)?;
            CacheOperation::Find(id)
        }
        (None, Some(page)) => CacheOperation::Paginate(Pagination::new(
            page,
            args.per_page.unwrap_or(Pagination::DEFAULT_PER_PAGE.get()),
        )),
        (None, None) => CacheOperation::All,
    };

    let params = QueryParams::from_query_str(&args.query);
    let plan = repository.query().request(&params)?.plan(operation);
    emit(&plan)
}

#[derive(Serialize)]
struct EncodeOutput {
    id: u64,
    token: String,
}

#[derive(Serialize)]
struct CheckOutput {
    entities: Vec<String>,
    cache_enabled: bool,
}

fn emit<T: Serialize>(value: &T) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout).map_err(InfraError::from)?;
    Ok(())
}
