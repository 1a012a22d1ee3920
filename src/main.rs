use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use finquery::compiler::{Attempt, DraftQuery, SafetyCompiler};
use finquery::db::init_pool;
use finquery::entity::{FuzzyEntityResolver, StorageCandidateSource};
use finquery::execution::{Executor, PgStorage};
use finquery::prompt::keywords_from_question;
use finquery::schema::fallback::minimal_schema;
use finquery::schema::{CatalogSource, PgCatalogSource, SchemaCatalog, StaticCatalogSource};
use finquery::validation::HeuristicValidator;
use finquery::{Answer, LlmClient, PipelineConfig, QueryIntent, QuestionRequest, RegenerationController, RoutingPolicy, TimeWindow};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "finquery")]
#[command(about = "Ask questions about your financial data, answered with tenant-safe SQL")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a natural-language question for one tenant
    Ask {
        question: String,

        #[arg(short, long)]
        tenant: String,

        #[arg(long, value_enum, default_value = "general")]
        intent: IntentArg,

        /// Start of the time window (YYYY-MM-DD)
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,

        /// End of the time window (YYYY-MM-DD)
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,

        /// Group by calendar month
        #[arg(long)]
        monthly: bool,

        /// Include pending transactions
        #[arg(long)]
        include_pending: bool,

        /// Print the full answer as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a draft statement through the safety compiler without executing it
    Compile {
        draft: String,

        #[arg(short, long)]
        tenant: String,
    },

    /// Print the schema subset the generator would see
    Schema {
        keywords: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum IntentArg {
    Spending,
    Income,
    Balance,
    Transactions,
    General,
}

impl From<IntentArg> for QueryIntent {
    fn from(arg: IntentArg) -> Self {
        match arg {
            IntentArg::Spending => QueryIntent::Spending,
            IntentArg::Income => QueryIntent::Income,
            IntentArg::Balance => QueryIntent::Balance,
            IntentArg::Transactions => QueryIntent::Transactions,
            IntentArg::General => QueryIntent::General,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env()?;

    match cli.command {
        Command::Ask {
            question,
            tenant,
            intent,
            from,
            to,
            monthly,
            include_pending,
            json,
        } => {
            let mut policy = RoutingPolicy::for_intent(intent.into());
            if let (Some(from), Some(to)) = (from, to) {
                policy = policy.with_time_window(TimeWindow::new(from, to));
            }
            policy.monthly = monthly;
            policy.include_pending = include_pending;
            let request = QuestionRequest::new(question, tenant).with_policy(policy);
            ask(&config, request, json).await
        }
        Command::Compile { draft, tenant } => {
            let catalog = Arc::new(open_catalog(&config).await);
            let compiler = SafetyCompiler::new(catalog, config.compiler.clone());
            match compiler.compile(&DraftQuery::new(draft, "", tenant, Attempt::first())) {
                Ok(compiled) => println!("{}", serde_json::to_string_pretty(&compiled)?),
                Err(fault) => println!("Rejected ({}): {}", fault.kind(), fault),
            }
            Ok(())
        }
        Command::Schema { keywords } => {
            let catalog = open_catalog(&config).await;
            let keywords: Vec<String> = keywords.iter().flat_map(|k| keywords_from_question(k)).collect();
            println!("{}", catalog.subset_for(&keywords));
            Ok(())
        }
    }
}

async fn ask(config: &PipelineConfig, request: QuestionRequest, json: bool) -> Result<()> {
    let pool = init_pool(&config.database)
        .await
        .context("Failed to connect to the database")?;
    let source: Arc<dyn CatalogSource> = Arc::new(PgCatalogSource::new(pool.clone(), config.database.schema.clone()));
    let catalog = Arc::new(
        SchemaCatalog::initialize(source, config.catalog.clone(), &config.compiler.tenant_column).await,
    );

    let executor = Arc::new(Executor::new(
        Arc::new(PgStorage::new(pool.clone())),
        config.executor.clone(),
    ));
    let generator = LlmClient::from_config(&config.generator).context("OPENAI_API_KEY is not set")?;
    info!("Using model {}", generator.model());

    let controller = RegenerationController::new(
        config,
        catalog,
        Arc::new(generator),
        Arc::clone(&executor),
        Arc::new(HeuristicValidator),
    )
    .with_entity_resolution(
        Arc::new(FuzzyEntityResolver::default()),
        Arc::new(StorageCandidateSource::new(executor, &config.compiler.tenant_column)),
    );

    let answer = controller.answer(&request).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
    } else {
        print_answer(&answer);
    }

    controller.log().shutdown();
    pool.close().await;
    Ok(())
}

/// Live catalog when a database is configured, the built-in schema otherwise.
async fn open_catalog(config: &PipelineConfig) -> SchemaCatalog {
    let tenant_column = &config.compiler.tenant_column;
    if config.database.url.is_some() {
        match init_pool(&config.database).await {
            Ok(pool) => {
                let source = Arc::new(PgCatalogSource::new(pool, config.database.schema.clone()));
                return SchemaCatalog::initialize(source, config.catalog.clone(), tenant_column).await;
            }
            Err(e) => warn!("Database unavailable, using built-in schema: {}", e),
        }
    }
    let source = Arc::new(StaticCatalogSource::new(minimal_schema(tenant_column)));
    SchemaCatalog::initialize(source, config.catalog.clone(), tenant_column).await
}

fn print_answer(answer: &Answer) {
    match answer {
        Answer::Answered { result, sql, attempts, .. } => {
            println!("\n=== Answer ({} attempt(s)) ===", attempts);
            match sql {
                Some(sql) => println!("SQL: {}", sql),
                None => println!("(served from cache)"),
            }
            println!("{}", result.columns.join(" | "));
            for row in &result.rows {
                let cells: Vec<String> = result
                    .columns
                    .iter()
                    .map(|c| row.get(c).map(|v| v.to_string()).unwrap_or_default())
                    .collect();
                println!("{}", cells.join(" | "));
            }
            println!("({} rows, {}ms)", result.row_count, result.duration_ms);
        }
        Answer::NoMatchingData { attempts, .. } => {
            println!("\nNo matching data ({} attempt(s)).", attempts);
        }
        Answer::Unanswerable { reason, attempts, trace } => {
            let trace: Vec<String> = trace.iter().map(|s| s.to_string()).collect();
            println!("\nCould not safely answer after {} attempt(s): {}", attempts, reason);
            println!("Trace: {}", trace.join(" -> "));
        }
    }
}
