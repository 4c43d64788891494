//! Tenantry CLI
//!
//! Operator commands against the control plane and the tenant fleet.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tenantry_api::{AppConfig, ProvisioningJob, Services};
use tenantry_core::{DeltaScript, Result, TenancyError, TenantFilter};
use tenantry_storage::ConnectionPoolConfig;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tenantry")]
#[command(version, about = "Tenantry operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending control-plane migrations
    Migrate,

    /// Inspect tenants
    Tenants {
        #[command(subcommand)]
        command: TenantCommands,
    },

    /// Roll a script out across tenant databases
    Delta {
        #[command(subcommand)]
        command: DeltaCommands,
    },

    /// Run the provisioning workflow for an unprovisioned tenant
    ///
    /// Declined while the server or another CLI run holds the tenant's
    /// provisioning claim.
    Provision {
        /// Tenant id
        tenant_id: Uuid,
    },
}

#[derive(Subcommand)]
enum TenantCommands {
    /// List tenants
    List {
        /// Include inactive and soft-deleted tenants
        #[arg(short, long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum DeltaCommands {
    /// Apply a SQL file to every matching tenant
    Apply {
        /// Path to the SQL script
        file: PathBuf,

        /// Script name for the report (defaults to the file stem)
        #[arg(short, long)]
        name: Option<String>,

        /// Only apply to this tenant
        #[arg(short, long)]
        tenant: Option<Uuid>,

        /// Include inactive tenants
        #[arg(long)]
        include_inactive: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    let config = AppConfig::from_env()?;
    let pool_config = ConnectionPoolConfig::from_env();
    pool_config.validate()?;
    let services = Services::connect(&config, pool_config).await?;

    let result = match command {
        Commands::Migrate => migrate(&services).await,
        Commands::Tenants {
            command: TenantCommands::List { all },
        } => list_tenants(&services, all).await,
        Commands::Delta {
            command:
                DeltaCommands::Apply {
                    file,
                    name,
                    tenant,
                    include_inactive,
                },
        } => apply_delta(&services, &file, name, tenant, include_inactive).await,
        Commands::Provision { tenant_id } => provision(&services, &config, tenant_id).await,
    };

    services.pools.close_all().await;
    result
}

async fn migrate(services: &Services) -> Result<ExitCode> {
    let applied = services.migrate().await?;
    if applied == 0 {
        println!("Control plane is up to date");
    } else {
        println!("Applied {} migration(s)", applied);
    }
    Ok(ExitCode::SUCCESS)
}

async fn list_tenants(services: &Services, all: bool) -> Result<ExitCode> {
    let filter = if all {
        TenantFilter::all().including_deleted()
    } else {
        TenantFilter::active()
    };
    let tenants = services.registry.find(&filter).await?;

    if tenants.is_empty() {
        println!("No tenants found");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<36}  {:<24}  {:<24}  {:<12}  {}",
        "ID", "SUBDOMAIN", "DATABASE", "STATE", "PROVISIONED"
    );
    for tenant in &tenants {
        let provisioned = tenant
            .database_created_on
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<24}  {:<24}  {:<12}  {}",
            tenant.id,
            tenant.subdomain_name,
            tenant.database_name,
            tenant.lifecycle(),
            provisioned
        );
        if let Some(error) = &tenant.provisioning_error {
            println!("{:>38}last error: {}", "", error);
        }
    }
    println!("\n{} tenant(s)", tenants.len());
    Ok(ExitCode::SUCCESS)
}

async fn apply_delta(
    services: &Services,
    file: &std::path::Path,
    name: Option<String>,
    tenant: Option<Uuid>,
    include_inactive: bool,
) -> Result<ExitCode> {
    let mut script = DeltaScript::from_file(file)?;
    if let Some(name) = name {
        script.name = name;
    }

    let mut filter = if include_inactive {
        TenantFilter::all()
    } else {
        TenantFilter::active()
    };
    filter.id = tenant;

    let report = services.delta_runner().apply(&script, &filter).await?;
    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|e| TenancyError::Other(format!("Failed to render report: {}", e)))?;
    println!("{}", rendered);

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!(
            "{} of {} tenant(s) failed",
            report.failed.len(),
            report.total()
        );
        Ok(ExitCode::FAILURE)
    }
}

async fn provision(services: &Services, config: &AppConfig, tenant_id: Uuid) -> Result<ExitCode> {
    let tenant = services.registry.get(tenant_id).await?;
    if !tenant.is_verified {
        return Err(TenancyError::ValidationError(format!(
            "Tenant {} has not been verified",
            tenant_id
        )));
    }
    if tenant.is_provisioned() {
        return Err(TenancyError::ConflictError(format!(
            "Tenant {} is already provisioned",
            tenant_id
        )));
    }

    tracing::info!(tenant_id = %tenant_id, attempt_error = ?tenant.provisioning_error, "Provisioning tenant inline");
    let job = ProvisioningJob::from_record(&tenant, &services.secrets)?;
    let outcome = services.provisioner(config)?.run(&job).await;
    let rendered = serde_json::to_string_pretty(&outcome)
        .map_err(|e| TenancyError::Other(format!("Failed to render outcome: {}", e)))?;
    println!("{}", rendered);

    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
