//! flowkube CLI - Flow service orchestrator

use clap::{Parser, Subcommand};
use flow_kube::api::*;
use flow_kube::config::DEFAULT_BIND;
use flow_kube::models::{MergeTemplate, ServiceTemplate, VmTemplate};
use flow_kube::{Error, Orchestrator, OrchestratorConfig, Reconciler, Result, Server, SimCloud};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{Table, Tabled};

#[derive(Parser)]
#[command(name = "flowkube")]
#[command(about = "Multi-role service orchestrator with dependencies and elasticity")]
#[command(version)]
struct Cli {
    /// API endpoint of a running `flowkube serve`
    #[arg(long, global = true, default_value = "http://127.0.0.1:2474")]
    endpoint: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Service template management
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },
    /// Service management
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },
    /// Run one reconciliation step for every service
    Reconcile,
    /// Start the orchestrator and its HTTP API
    Serve {
        /// Address to bind to
        #[arg(long, default_value = DEFAULT_BIND)]
        bind: String,
        /// JSON config file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// SQLite database (overrides the config file)
        #[arg(long)]
        db: Option<PathBuf>,
        /// JSON array of VM templates for the simulated cloud
        #[arg(long)]
        vm_templates: Option<PathBuf>,
        /// Move simulated VMs one lifecycle step per tick
        #[arg(long)]
        stepped: bool,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// Register a service template from a JSON file
    Create {
        file: PathBuf,
    },
    /// List service templates
    List,
    /// Show a service template
    Show {
        id: u64,
    },
    /// Delete a service template
    Delete {
        id: u64,
    },
    /// Create a service from a template
    Instantiate {
        id: u64,
        /// Service name
        #[arg(short, long)]
        name: Option<String>,
        /// JSON file with merge overrides
        #[arg(short, long)]
        merge: Option<PathBuf>,
        /// Owner of the new service
        #[arg(short, long)]
        user: Option<String>,
    },
}

#[derive(Subcommand)]
enum ServiceAction {
    /// List services that are not DONE
    List,
    /// Show a service, its roles and log
    Show {
        id: u64,
    },
    /// Undeploy a service
    Shutdown {
        id: u64,
    },
    /// Retry the failed transition of a service
    Recover {
        id: u64,
    },
    /// Delete a service record
    Delete {
        id: u64,
        /// Delete even if not DONE, terminating what is left
        #[arg(short, long)]
        force: bool,
    },
    /// Change the cardinality of a role
    Scale {
        id: u64,
        role: String,
        cardinality: usize,
        /// Ignore role bounds
        #[arg(short, long)]
        force: bool,
    },
}

// Table display structs
#[derive(Tabled)]
struct TemplateRow {
    #[tabled(rename = "ID")]
    id: u64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Owner")]
    owner: String,
    #[tabled(rename = "Roles")]
    roles: String,
}

#[derive(Tabled)]
struct ServiceRow {
    #[tabled(rename = "ID")]
    id: u64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Owner")]
    owner: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Roles")]
    roles: usize,
}

#[derive(Tabled)]
struct RoleRow {
    #[tabled(rename = "Role")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Card")]
    cardinality: usize,
    #[tabled(rename = "Min")]
    min: usize,
    #[tabled(rename = "Max")]
    max: usize,
    #[tabled(rename = "VMs")]
    vms: String,
    #[tabled(rename = "Parents")]
    parents: String,
}

#[derive(Tabled)]
struct LogRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Message")]
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("flow_kube=info")),
        )
        .init();

    let cli = Cli::parse();
    let client = Client::new(&cli.endpoint);

    match cli.command {
        Commands::Template { action } => handle_template(&client, action).await?,
        Commands::Service { action } => handle_service(&client, action).await?,
        Commands::Reconcile => {
            let resp: ReconcileResponse = client.post("/api/v1/reconcile", &()).await?;
            println!("Reconciled {} service(s).", resp.stepped);
        }
        Commands::Serve {
            bind,
            config,
            db,
            vm_templates,
            stepped,
        } => serve(&bind, config, db, vm_templates, stepped).await?,
    }

    Ok(())
}

async fn serve(
    bind: &str,
    config: Option<PathBuf>,
    db: Option<PathBuf>,
    vm_templates: Option<PathBuf>,
    stepped: bool,
) -> Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| Error::Config(format!("invalid bind address '{}': {}", bind, e)))?;

    let mut config = match config {
        Some(path) => OrchestratorConfig::from_file(path)?,
        None => OrchestratorConfig::default(),
    };
    if let Some(db) = db {
        config = config.db_path(db);
    }

    let cloud = Arc::new(if stepped { SimCloud::new() } else { SimCloud::instant() });
    let templates: Vec<VmTemplate> = match vm_templates {
        Some(path) => read_json(&path)?,
        None => vec![VmTemplate::new(0, "default", flow_kube::ADMIN_USER).with_public(true)],
    };
    for template in templates {
        cloud.register_template(template);
    }

    let orch = Arc::new(Orchestrator::simulated(config, cloud.clone())?);
    let reconciler = Reconciler::new(orch.clone())
        .before_tick(Box::new(move || cloud.advance()))
        .spawn();

    println!("Starting API server on http://{}", addr);
    println!();
    println!("Endpoints:");
    println!("  GET    /health                                  Health check");
    println!("  GET    /api/v1/service_templates                List templates");
    println!("  POST   /api/v1/service_templates                Create template");
    println!("  GET    /api/v1/service_templates/:id            Show template");
    println!("  DELETE /api/v1/service_templates/:id            Delete template");
    println!("  POST   /api/v1/service_templates/:id/instantiate  Create service");
    println!("  GET    /api/v1/services                         List services");
    println!("  GET    /api/v1/services/:id                     Show service");
    println!("  DELETE /api/v1/services/:id[?force=true]        Delete service");
    println!("  POST   /api/v1/services/:id/shutdown            Undeploy service");
    println!("  POST   /api/v1/services/:id/recover             Recover service");
    println!("  POST   /api/v1/services/:id/roles/:role/scale   Scale role");
    println!("  POST   /api/v1/operations                       Typed operation");
    println!("  POST   /api/v1/reconcile                        Reconcile now");
    println!();

    let server = Server::new(orch, addr);
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    reconciler.stop().await;
    Ok(())
}

async fn handle_template(client: &Client, action: TemplateAction) -> Result<()> {
    match action {
        TemplateAction::Create { file } => {
            let template: ServiceTemplate = read_json(&file)?;
            let created: TemplateResponse = client.post("/api/v1/service_templates", &template).await?;
            println!("Service template registered: {} ({})", created.name, created.id);
        }
        TemplateAction::List => {
            let templates: Vec<TemplateResponse> = client.get("/api/v1/service_templates").await?;
            if templates.is_empty() {
                println!("No service templates registered.");
                return Ok(());
            }
            let rows: Vec<TemplateRow> = templates
                .into_iter()
                .map(|t| TemplateRow {
                    id: t.id,
                    name: t.name,
                    owner: t.owner,
                    roles: t.roles.join(", "),
                })
                .collect();
            println!("{}", Table::new(rows));
        }
        TemplateAction::Show { id } => {
            let template: TemplateResponse =
                client.get(&format!("/api/v1/service_templates/{}", id)).await?;
            println!("{}", serde_json::to_string_pretty(&template.body)?);
        }
        TemplateAction::Delete { id } => {
            let resp: ApiSuccess = client.delete(&format!("/api/v1/service_templates/{}", id)).await?;
            println!("{}", resp.message);
        }
        TemplateAction::Instantiate {
            id,
            name,
            merge,
            user,
        } => {
            let mut merge: MergeTemplate = match merge {
                Some(path) => read_json(&path)?,
                None => MergeTemplate::default(),
            };
            if name.is_some() {
                merge.name = name;
            }
            let req = InstantiateServiceRequest { user, merge };
            let created: ServiceCreated = client
                .post(&format!("/api/v1/service_templates/{}/instantiate", id), &req)
                .await?;
            println!("Service created: {}", created.id);
        }
    }
    Ok(())
}

async fn handle_service(client: &Client, action: ServiceAction) -> Result<()> {
    match action {
        ServiceAction::List => {
            let services: Vec<ServiceResponse> = client.get("/api/v1/services").await?;
            if services.is_empty() {
                println!("No services.");
                return Ok(());
            }
            let rows: Vec<ServiceRow> = services
                .into_iter()
                .map(|s| ServiceRow {
                    id: s.id,
                    name: s.name,
                    owner: s.owner,
                    state: s.state,
                    roles: s.roles.len(),
                })
                .collect();
            println!("{}", Table::new(rows));
        }
        ServiceAction::Show { id } => {
            let service: ServiceResponse = client.get(&format!("/api/v1/services/{}", id)).await?;
            print_service(service);
        }
        ServiceAction::Shutdown { id } => {
            let resp: ApiSuccess = client
                .post(&format!("/api/v1/services/{}/shutdown", id), &())
                .await?;
            println!("{}", resp.message);
        }
        ServiceAction::Recover { id } => {
            let resp: ApiSuccess = client
                .post(&format!("/api/v1/services/{}/recover", id), &())
                .await?;
            println!("{}", resp.message);
        }
        ServiceAction::Delete { id, force } => {
            let resp: ApiSuccess = client
                .delete(&format!("/api/v1/services/{}?force={}", id, force))
                .await?;
            println!("{}", resp.message);
        }
        ServiceAction::Scale {
            id,
            role,
            cardinality,
            force,
        } => {
            let resp: ApiSuccess = client
                .post(
                    &format!("/api/v1/services/{}/roles/{}/scale", id, role),
                    &ScaleRequest { cardinality, force },
                )
                .await?;
            println!("{}", resp.message);
        }
    }
    Ok(())
}

fn print_service(service: ServiceResponse) {
    println!("Service: {} ({})", service.name, service.id);
    println!("  Owner:    {}", service.owner);
    println!("  Template: {}", service.template_id);
    println!("  State:    {}", service.state);
    if let Some(start) = &service.start_time {
        println!("  Started:  {}", start);
    }
    for (name, id) in &service.networks {
        println!("  Network:  {} -> {}", name, id);
    }
    println!();

    let roles: Vec<RoleRow> = service
        .roles
        .into_iter()
        .map(|r| RoleRow {
            name: r.name,
            state: r.state,
            cardinality: r.cardinality,
            min: r.min_vms,
            max: r.max_vms,
            vms: r
                .nodes
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(","),
            parents: r.parents.join(","),
        })
        .collect();
    println!("{}", Table::new(roles));

    let skip = service.log.len().saturating_sub(10);
    let log: Vec<LogRow> = service
        .log
        .into_iter()
        .skip(skip)
        .map(|e| LogRow {
            time: e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            state: e.state.to_string(),
            message: e.message,
        })
        .collect();
    println!("{}", Table::new(log));
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Thin JSON client for the orchestrator API
struct Client {
    http: reqwest::Client,
    endpoint: String,
}

impl Client {
    fn new(endpoint: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(format!("{}{}", self.endpoint, path))
            .send()
            .await
            .map_err(transport_error)?;
        decode(resp).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self
            .http
            .post(format!("{}{}", self.endpoint, path))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        decode(resp).await
    }

    async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .delete(format!("{}{}", self.endpoint, path))
            .send()
            .await
            .map_err(transport_error)?;
        decode(resp).await
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    Error::TransientInfra(format!("cannot reach orchestrator: {}", e))
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    let bytes = resp.bytes().await.map_err(transport_error)?;
    if status.is_success() {
        return Ok(serde_json::from_slice(&bytes)?);
    }
    match serde_json::from_slice::<ApiError>(&bytes) {
        Ok(err) => Err(Error::Other(format!("{} ({}): {}", err.error, status, err.message))),
        Err(_) => Err(Error::Other(format!("request failed with {}", status))),
    }
}
