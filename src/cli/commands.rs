use crate::cli::args::{Args, Command, ConfigCommand};
use crate::core::arbiter::DeviceArbiter;
use crate::core::handler::MoveOutcome;
use crate::domain::error::{RigError, RigResult};
use crate::infrastructure::config::ConfigManager;
use std::path::Path;

const CLI_OWNER: &str = "cli";

/// Execute CLI command
pub async fn execute_command(args: Args) -> RigResult<()> {
    let config_manager = ConfigManager::new()?;

    // Commands that do not need open instruments.
    match &args.command {
        Command::Ports => return list_ports(),
        Command::Config { command } => return execute_config_command(command, &config_manager, &args),
        _ => {}
    }

    let config = if let Some(config_path) = &args.config {
        config_manager.load_config_from_path(Path::new(config_path))?
    } else {
        config_manager.load_config()?
    };

    let arbiter = DeviceArbiter::open(&config)?;
    arbiter.set_owner(CLI_OWNER).await?;

    match args.command {
        Command::Status => {
            let handler = arbiter.handler().is_ok().await;
            let degausser = arbiter.degausser().is_ok().await;
            let magnetometer = arbiter.magnetometer().is_ok().await;
            println!("handler:      {}", if handler { "ok" } else { "FAILED" });
            println!("degausser:    {}", if degausser { "ok" } else { "FAILED" });
            println!("magnetometer: {}", if magnetometer { "ok" } else { "FAILED" });
            if !(handler && degausser && magnetometer) {
                return Err(RigError::Connection {
                    message: "one or more devices failed the health check".to_string(),
                });
            }
        }
        Command::Move { position } => {
            arbiter.set_measuring(CLI_OWNER, true).await?;
            let handler = arbiter.handler();
            handler.move_to_pos(position).await?;
            let outcome = handler.join().await;
            arbiter.set_measuring(CLI_OWNER, false).await?;
            match outcome? {
                MoveOutcome::Complete => println!("move complete at {}", position),
                MoveOutcome::HardLimit => println!("stopped at hard limit; position unknown"),
            }
        }
        Command::Rotate { angle } => {
            arbiter.set_measuring(CLI_OWNER, true).await?;
            let handler = arbiter.handler();
            handler.rotate_to(angle).await?;
            let outcome = handler.join().await;
            arbiter.set_measuring(CLI_OWNER, false).await?;
            match outcome? {
                MoveOutcome::Complete => {
                    println!("rotation complete at {:.1} deg", angle.rem_euclid(360.0))
                }
                MoveOutcome::HardLimit => println!("stopped at hard limit; rotation unknown"),
            }
        }
        Command::Demag { coil, amplitude } => {
            arbiter.set_measuring(CLI_OWNER, true).await?;
            let result = arbiter.degausser().demagnetize(coil.into(), amplitude).await;
            arbiter.set_measuring(CLI_OWNER, false).await?;
            result?;
            println!("demagnetization cycle complete");
        }
        Command::Read => {
            arbiter.set_measuring(CLI_OWNER, true).await?;
            let reading = arbiter.magnetometer().read_data().await;
            arbiter.set_measuring(CLI_OWNER, false).await?;
            let reading = reading?;
            println!("x: {:e}", reading.x);
            println!("y: {:e}", reading.y);
            println!("z: {:e}", reading.z);
        }
        Command::Ports | Command::Config { .. } => unreachable!("handled above"),
    }

    arbiter.release_owner(CLI_OWNER).await?;
    Ok(())
}

fn list_ports() -> RigResult<()> {
    let ports = serialport::available_ports()?;
    if ports.is_empty() {
        println!("no serial ports found");
        return Ok(());
    }
    for port in ports {
        println!("{}", port.port_name);
    }
    Ok(())
}

fn execute_config_command(
    command: &ConfigCommand,
    config_manager: &ConfigManager,
    args: &Args,
) -> RigResult<()> {
    match command {
        ConfigCommand::Show => {
            let config = if let Some(config_path) = &args.config {
                config_manager.load_config_from_path(Path::new(config_path))?
            } else {
                config_manager.load_config()?
            };
            let rendered = toml::to_string_pretty(&config).map_err(|e| RigError::Config {
                message: format!("failed to render config: {}", e),
            })?;
            println!("{}", rendered);
        }
        ConfigCommand::Init => {
            let path = config_manager.init_global_config()?;
            println!("wrote example configuration to {}", path.display());
        }
    }
    Ok(())
}
