//! Command-line dispatch.
//!
//! The binary is a thin veneer: parse, build an [`Engine`], call the
//! matching operation.

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use crate::checkout::SystemPackage;
use crate::config::Config;
use crate::deploy::{self, InstallOpts};
use crate::engine::Engine;

/// Manage system containers backed by a content-addressed image store.
#[derive(Debug, Parser)]
#[command(name = "syscon", version, about)]
pub struct Opt {
    /// Operate on the per-user store and session service manager.
    #[arg(long, global = true)]
    pub user: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Pull an image into the store.
    Pull {
        /// Image reference (`registry/name:tag`, `docker:`, `dockertar:/`
        /// or `ostree:`).
        image: String,
    },
    /// Install an image as a system container.
    Install {
        image: String,
        /// Container name; derived from the image when omitted.
        name: Option<String>,
        /// Set a template variable (may be repeated).
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
        /// Host package handling: no, yes, auto, build or absent.
        #[arg(long, default_value = "no")]
        system_package: String,
        /// Deploy against an existing rootfs instead of extracting one.
        #[arg(long)]
        rootfs: Option<Utf8PathBuf>,
        /// OCI runtime to use instead of the default.
        #[arg(long)]
        runtime: Option<String>,
    },
    /// Remove a container and everything it installed.
    Uninstall { name: String },
    /// Upgrade a container to the latest imported image.
    Update {
        name: String,
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
        /// Switch to a different image while upgrading.
        #[arg(long)]
        rebase: Option<String>,
    },
    /// Switch a container back to its previous deployment.
    Rollback { name: String },
    /// Show the service state of a container.
    Status { name: String },
    /// List imported images.
    Images {
        /// Include bare layer branches.
        #[arg(long)]
        all: bool,
    },
    /// List installed containers.
    Containers,
    /// Show the template variables an image supports.
    TemplateVariables { image: String },
    /// Extract an image's rootfs to a directory.
    Extract {
        image: String,
        destination: Utf8PathBuf,
    },
    /// Remove unreferenced images, layers and orphaned deployments.
    Prune,
}

/// Parse `args` and run the selected operation.
pub async fn run_from_iter<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let opt = Opt::parse_from(args);
    let config = Config::new(opt.user)?;
    let engine = Engine::new(config);
    match opt.command {
        Command::Pull { image } => {
            engine.pull_image(&image, true).await?;
        }
        Command::Install {
            image,
            name,
            set,
            system_package,
            rootfs,
            runtime,
        } => {
            let name = name.unwrap_or_else(|| deploy::default_system_name(&image));
            let system_package: SystemPackage = system_package.parse()?;
            engine
                .install(
                    &image,
                    &name,
                    InstallOpts {
                        set,
                        system_package,
                        rootfs,
                        runtime,
                    },
                )
                .await?;
        }
        Command::Uninstall { name } => engine.uninstall(&name)?,
        Command::Update { name, set, rebase } => {
            engine.update(&name, &set, rebase.as_deref())?
        }
        Command::Rollback { name } => engine.rollback(&name)?,
        Command::Status { name } => println!("{}", engine.container_state(&name)?),
        Command::Images { all } => {
            println!("{:<48} {:<16} {:>12}", "REPOSITORY", "IMAGE ID", "SIZE");
            for image in engine.images(all)? {
                let id = image.image_id.chars().take(12).collect::<String>();
                let size = image
                    .virtual_size
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<48} {:<16} {:>12}", image.tag, id, size);
            }
        }
        Command::Containers => {
            println!("{:<20} {:<40} {:<16} COMMAND", "NAME", "IMAGE", "IMAGE ID");
            for c in engine.containers()? {
                let id = c.revision.chars().take(12).collect::<String>();
                println!("{:<20} {:<40} {:<16} {}", c.name, c.image, id, c.command);
            }
        }
        Command::TemplateVariables { image } => {
            let vars = engine.template_variables(&image)?;
            for (name, default) in &vars.settable {
                match default {
                    Some(d) if !d.is_empty() => println!("{name}: {d}"),
                    _ => println!("{name}"),
                }
            }
            if !vars.reserved.is_empty() {
                println!();
                println!("Reserved (set by the engine):");
                for name in &vars.reserved {
                    println!("{name}");
                }
            }
        }
        Command::Extract { image, destination } => engine.extract(&image, &destination)?,
        Command::Prune => engine.prune_images()?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let opt = Opt::parse_from([
            "syscon",
            "install",
            "--set",
            "PORT=8080",
            "--system-package",
            "auto",
            "example.com/app:1.0",
            "app",
        ]);
        match opt.command {
            Command::Install {
                image,
                name,
                set,
                system_package,
                ..
            } => {
                assert_eq!(image, "example.com/app:1.0");
                assert_eq!(name.as_deref(), Some("app"));
                assert_eq!(set, vec!["PORT=8080".to_string()]);
                assert_eq!(system_package, "auto");
            }
            o => panic!("unexpected command {o:?}"),
        }
        assert!(!opt.user);

        let opt = Opt::parse_from(["syscon", "--user", "images", "--all"]);
        assert!(opt.user);
        assert!(matches!(opt.command, Command::Images { all: true }));
    }
}
