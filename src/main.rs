//! Tenant isolation operations tool
//!
//! Post-deploy checks and policy installation against a live database.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tenancy_common::config::IsolationConfig;
use tenancy_guard::IsolationService;
use tenancy_rls::postgres::PgDatabase;
use tenancy_rls::TenantPolicy;

#[derive(Parser, Debug)]
#[command(name = "tenancy-guard")]
#[command(about = "Tenant isolation checks and policy management", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "tenancy.toml")]
    config: PathBuf,

    /// Database URL, overrides the configuration file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate RLS and tenant policies on every tenant table
    Validate,
    /// Inspect a single table
    CheckTable { table: String },
    /// Run the live isolation smoke test for a tenant
    Probe { tenant_id: String },
    /// Enable RLS and (re)create the tenant policy on every tenant table
    InstallPolicies,
    /// Print the policy DDL without connecting
    PrintPolicies,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    // Load configuration
    let mut config = if args.config.exists() {
        IsolationConfig::load(&args.config)?
    } else {
        info!("Using default configuration");
        IsolationConfig::default()
    };
    if let Some(url) = args.database_url.clone() {
        config.database.url = url;
    }

    match &args.command {
        Command::PrintPolicies => {
            for policy in TenantPolicy::for_config(&config.rls)? {
                for statement in policy.statements() {
                    println!("{statement};");
                }
                println!();
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::InstallPolicies => {
            let database = PgDatabase::connect(&config.database, &config.rls.schema).await?;
            database
                .install_policies(&TenantPolicy::for_config(&config.rls)?)
                .await?;
            let service = IsolationService::new(Arc::new(database), &config.rls)?;
            report_validation(&service, args.json).await
        }
        Command::Validate => {
            let service = IsolationService::connect(&config).await?;
            report_validation(&service, args.json).await
        }
        Command::CheckTable { table } => {
            let service = IsolationService::connect(&config).await?;
            let status = service.check_table(table).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!(
                    "{}: rls_enabled={} policy_exists={}",
                    status.table_name, status.rls_enabled, status.policy_exists
                );
            }
            Ok(if status.rls_enabled && status.policy_exists {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Probe { tenant_id } => {
            let service = IsolationService::connect(&config).await?;
            let result = service.probe(tenant_id).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "{}: without_context={} with_context={}",
                    if result.passed { "PASS" } else { "FAIL" },
                    result.without_context_row_count,
                    result.with_context_row_count
                );
                if let Some(error) = &result.error {
                    println!("  {error}");
                }
            }
            Ok(if result.passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

async fn report_validation(
    service: &IsolationService<PgDatabase>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let result = service.validate_all().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for table in &result.tables {
            println!(
                "{:<28} rls={:<5} policy={}",
                table.table_name,
                table.rls_enabled,
                table.policy_name.as_deref().unwrap_or("-")
            );
        }
        for table in &result.unlisted_tables {
            println!("{table:<28} not in tenant_tables");
        }
        if let Some(error) = &result.error {
            println!("{error}");
        }
    }
    Ok(if result.valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
