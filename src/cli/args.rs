//! Command-line argument parsing

use crate::config::RegistryConfig;
use crate::credentials::DEFAULT_NAMESPACE;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "repo-lister")]
#[command(about = "List, copy, pull and push container images using Kubernetes registry secrets")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output
    #[arg(long = "verbose", short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Quiet mode
    #[arg(
        long = "quiet",
        short = 'q',
        global = true,
        help = "Only print results and errors"
    )]
    pub quiet: bool,

    #[arg(
        long = "insecure-registry",
        global = true,
        value_name = "HOST",
        help = "Talk plain HTTP to this registry host (repeatable)"
    )]
    pub insecure_registries: Vec<String>,

    /// Skip TLS verification
    #[arg(
        long = "skip-tls",
        global = true,
        help = "Skip TLS certificate verification"
    )]
    pub skip_tls: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List image tags from a container registry
    #[command(after_help = LIST_EXAMPLES)]
    List(ListArgs),
    /// Copy an image or multi-platform index between registries
    #[command(after_help = COPY_EXAMPLES)]
    Copy(CopyArgs),
    /// Save an image from a registry to a local tarball
    Pull(PullArgs),
    /// Upload a local image tarball to a registry
    Push(PushArgs),
}

#[derive(Debug, ClapArgs)]
pub struct ListArgs {
    #[arg(long = "image", short = 'i', help = "Image repository to list tags for")]
    pub image: String,

    #[arg(
        long = "filter",
        short = 'f',
        default_value = ".*",
        help = "Regex the whole tag must match"
    )]
    pub filter: String,

    #[arg(
        long = "secret",
        short = 's',
        default_value = "",
        help = "Kubernetes secret with registry credentials (omit for public registries)"
    )]
    pub secret: String,

    #[arg(
        long = "namespace",
        short = 'n',
        default_value = DEFAULT_NAMESPACE,
        help = "Kubernetes namespace of the secret"
    )]
    pub namespace: String,

    #[arg(
        long = "limit",
        short = 'l',
        default_value_t = 5,
        allow_negative_numbers = true,
        help = "Maximum number of tags to return (0 or less for all)"
    )]
    pub limit: i64,
}

#[derive(Debug, ClapArgs)]
pub struct CopyArgs {
    #[arg(long = "source", short = 's', help = "Source image reference")]
    pub source: String,

    #[arg(long = "destination", short = 'd', help = "Destination image reference")]
    pub destination: String,

    #[arg(
        long = "source-secret",
        default_value = "",
        help = "Kubernetes secret for the source registry"
    )]
    pub source_secret: String,

    #[arg(
        long = "dest-secret",
        default_value = "",
        help = "Kubernetes secret for the destination registry"
    )]
    pub dest_secret: String,

    #[arg(
        long = "source-namespace",
        default_value = DEFAULT_NAMESPACE,
        help = "Kubernetes namespace of the source secret"
    )]
    pub source_namespace: String,

    #[arg(
        long = "dest-namespace",
        default_value = DEFAULT_NAMESPACE,
        help = "Kubernetes namespace of the destination secret"
    )]
    pub dest_namespace: String,

    #[arg(long = "progress", short = 'p', help = "Show byte-level progress")]
    pub progress: bool,
}

#[derive(Debug, ClapArgs)]
pub struct PullArgs {
    #[arg(long = "image", short = 'i', help = "Image reference to save")]
    pub image: String,

    #[arg(long = "output", short = 'o', help = "Path of the tarball to write")]
    pub output: PathBuf,

    #[arg(
        long = "secret",
        short = 's',
        default_value = "",
        help = "Kubernetes secret with registry credentials"
    )]
    pub secret: String,

    #[arg(
        long = "namespace",
        short = 'n',
        default_value = DEFAULT_NAMESPACE,
        help = "Kubernetes namespace of the secret"
    )]
    pub namespace: String,

    #[arg(
        long = "platform",
        default_value = "linux/amd64",
        help = "Platform to pick from multi-platform images (os/arch[/variant])"
    )]
    pub platform: String,
}

#[derive(Debug, ClapArgs)]
pub struct PushArgs {
    #[arg(long = "image", short = 'i', help = "Destination image reference")]
    pub image: String,

    #[arg(long = "source", short = 'f', help = "Path of the docker-save tarball")]
    pub source: PathBuf,

    #[arg(
        long = "secret",
        short = 's',
        default_value = "",
        help = "Kubernetes secret with registry credentials"
    )]
    pub secret: String,

    #[arg(
        long = "namespace",
        short = 'n',
        default_value = DEFAULT_NAMESPACE,
        help = "Kubernetes namespace of the secret"
    )]
    pub namespace: String,

    #[arg(long = "progress", short = 'p', help = "Show byte-level progress")]
    pub progress: bool,
}

const LIST_EXAMPLES: &str = "Examples:
  # Public repository, five newest versions
  repo-lister list --image bitnami/redis

  # Private registry with a pull secret and a tag filter
  repo-lister list -i myregistry.io/app -s registry-cred -n apps -f 'v[0-9]+\\..*' -l 10";

const COPY_EXAMPLES: &str = "Examples:
  repo-lister copy -s nginx:1.27 -d myregistry.io/mirror/nginx:1.27 --dest-secret push-cred -p";

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }

    /// Registry settings from flags, then environment overrides
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::new(self.skip_tls, self.insecure_registries.clone()).with_env_overrides()
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        match &self.command {
            Command::List(args) if args.image.trim().is_empty() => {
                Err("--image must not be empty".to_string())
            }
            Command::Copy(args)
                if args.source.trim().is_empty() || args.destination.trim().is_empty() =>
            {
                Err("--source and --destination must not be empty".to_string())
            }
            Command::Pull(args) if args.output.as_os_str().is_empty() => {
                Err("--output must not be empty".to_string())
            }
            Command::Push(args) if !args.source.exists() => Err(format!(
                "archive does not exist: {}",
                args.source.display()
            )),
            _ => Ok(()),
        }
    }
}
