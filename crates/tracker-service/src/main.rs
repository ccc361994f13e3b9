//! Main entry point for the order tracker service.
//!
//! This binary wires the configured storage backend to the order lifecycle
//! service and exposes the tracker commands on the command line: placing,
//! preparing, picking up, and cancelling orders, looking orders up by id or
//! customer, and watching the live update stream.

use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracker_orders::OrderService;
use tracker_store::{StoreFactory, StoreService};
use tracker_types::Order;

mod config;

use config::Config;

/// Command-line arguments for the tracker service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,

	#[command(subcommand)]
	command: Command,
}

/// Tracker commands.
#[derive(Subcommand, Debug)]
enum Command {
	/// Place a new order for a product and customer
	Place {
		#[arg(long)]
		product_id: String,
		#[arg(long)]
		customer_id: String,
	},
	/// Prepare a placed order
	Prepare { id: String },
	/// Pick up a prepared order
	PickUp { id: String },
	/// Cancel an order that has not been prepared yet
	Cancel { id: String },
	/// Show a single order by id
	Get { id: String },
	/// List all orders, optionally scoped to one customer
	List {
		#[arg(long)]
		customer: Option<String>,
	},
	/// Stream order updates until interrupted
	Watch,
}

/// Main entry point for the tracker service.
///
/// This function:
/// 1. Parses command-line arguments
/// 2. Initializes logging infrastructure
/// 3. Loads configuration from file
/// 4. Builds the storage backend and the order service
/// 5. Runs the requested command
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	// Initialize tracing with env filter
	use tracing_subscriber::{fmt, EnvFilter};

	// Create env filter with default from args
	let default_directive = args.log_level.to_string();
	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

	fmt().with_env_filter(env_filter).with_target(true).init();

	let config_path = args
		.config
		.to_str()
		.ok_or("Configuration path is not valid UTF-8")?;
	let config = Config::from_file(config_path)?;
	tracing::info!("Loaded configuration [{}]", config.tracker.id);

	let store = build_store(&config)?;
	let service = OrderService::new(Arc::new(store));

	match args.command {
		Command::Place {
			product_id,
			customer_id,
		} => {
			let order = service.place_order(&product_id, &customer_id).await?;
			print_order(&order)?;
		},
		Command::Prepare { id } => {
			let order = service.prepare_order(&id).await?;
			print_order(&order)?;
		},
		Command::PickUp { id } => {
			let order = service.pick_up_order(&id).await?;
			print_order(&order)?;
		},
		Command::Cancel { id } => {
			let order = service.cancel_order(&id).await?;
			print_order(&order)?;
		},
		Command::Get { id } => {
			let order = service.get_order(&id).await?;
			print_order(&order)?;
		},
		Command::List { customer } => {
			let orders = match customer {
				Some(customer_id) => service.get_orders_by_customer(&customer_id).await?,
				None => service.get_all_orders().await?,
			};
			println!("{}", serde_json::to_string_pretty(&orders)?);
		},
		Command::Watch => {
			watch(&service).await?;
		},
	}

	Ok(())
}

/// Builds the configured storage backend and validates its configuration.
fn build_store(config: &Config) -> Result<StoreService, Box<dyn std::error::Error>> {
	let factories: HashMap<&'static str, StoreFactory> =
		tracker_store::get_all_implementations().into_iter().collect();

	let factory = factories
		.get(config.storage.primary.as_str())
		.ok_or_else(|| format!("Unknown storage backend '{}'", config.storage.primary))?;

	let backend_config = config
		.storage
		.implementations
		.get(&config.storage.primary)
		.cloned()
		.unwrap_or(toml::Value::Table(toml::map::Map::new()));

	let backend = factory(&backend_config)?;
	backend.config_schema().validate(&backend_config)?;

	tracing::debug!(backend = %config.storage.primary, "Storage backend ready");
	Ok(StoreService::new(backend))
}

/// Streams order updates to stdout until the store closes or Ctrl-C.
async fn watch(service: &OrderService) -> Result<(), Box<dyn std::error::Error>> {
	let mut updates = service.updates();
	tracing::info!("Watching order updates, Ctrl-C to stop");

	loop {
		tokio::select! {
			maybe_update = updates.recv() => {
				match maybe_update {
					Some(update) => {
						let line = serde_json::json!({
							"event": update.event,
							"order": update.order,
						});
						println!("{}", serde_json::to_string_pretty(&line)?);
					},
					None => break,
				}
			}
			_ = tokio::signal::ctrl_c() => {
				tracing::info!("Stopping watch");
				break;
			}
		}
	}

	Ok(())
}

fn print_order(order: &Order) -> Result<(), Box<dyn std::error::Error>> {
	println!("{}", serde_json::to_string_pretty(order)?);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn args_default_values() {
		let args = Args::try_parse_from(["tracker", "list"]).unwrap();

		assert_eq!(args.config, PathBuf::from("config.toml"));
		assert_eq!(args.log_level, "info");
		assert!(matches!(args.command, Command::List { customer: None }));
	}

	#[test]
	fn place_command_parses_references() {
		let args = Args::try_parse_from([
			"tracker",
			"place",
			"--product-id",
			"P1",
			"--customer-id",
			"C1",
		])
		.unwrap();

		match args.command {
			Command::Place {
				product_id,
				customer_id,
			} => {
				assert_eq!(product_id, "P1");
				assert_eq!(customer_id, "C1");
			},
			other => panic!("Unexpected command: {:?}", other),
		}
	}

	#[test]
	fn pick_up_command_uses_kebab_case() {
		let args = Args::try_parse_from(["tracker", "pick-up", "some-id"]).unwrap();
		assert!(matches!(args.command, Command::PickUp { id } if id == "some-id"));
	}

	#[test]
	fn list_accepts_customer_scope() {
		let args = Args::try_parse_from(["tracker", "list", "--customer", "C1"]).unwrap();
		assert!(matches!(
			args.command,
			Command::List { customer: Some(c) } if c == "C1"
		));
	}

	#[test]
	fn build_store_rejects_unknown_backend() {
		let config = Config {
			tracker: config::TrackerConfig {
				id: "test".into(),
			},
			storage: config::StorageConfig {
				primary: "redis".into(),
				implementations: HashMap::new(),
			},
		};

		let result = build_store(&config);
		assert!(result.is_err());
	}

	#[test]
	fn build_store_creates_memory_backend() {
		let mut implementations = HashMap::new();
		implementations.insert(
			"memory".to_string(),
			toml::Value::Table(toml::map::Map::new()),
		);
		let config = Config {
			tracker: config::TrackerConfig {
				id: "test".into(),
			},
			storage: config::StorageConfig {
				primary: "memory".into(),
				implementations,
			},
		};

		assert!(build_store(&config).is_ok());
	}
}
