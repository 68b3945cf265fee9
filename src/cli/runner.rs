//! Command dispatch

use crate::archive::ImageArchiver;
use crate::cli::args::{Args, Command, CopyArgs, ListArgs, PullArgs, PushArgs};
use crate::credentials::{AuthContext, CredentialResolver};
use crate::digest::DigestUtils;
use crate::error::{Error, Result};
use crate::image::manifest::Platform;
use crate::logging::Logger;
use crate::registry::{
    PROGRESS_QUEUE_CAPACITY, ProgressReceiver, ProgressSink, RegistryClient, progress_channel,
};
use crate::tags::TagResolver;
use crate::transfer::Transferer;
use tokio::task::JoinHandle;

pub struct Runner {
    args: Args,
    logger: Logger,
    resolver: CredentialResolver,
}

impl Runner {
    pub fn new(args: Args) -> Self {
        let logger = Logger::new(args.verbose, args.quiet);
        Self {
            args,
            logger,
            resolver: CredentialResolver::new(),
        }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub async fn run(&self) -> Result<()> {
        self.args.validate().map_err(Error::Validation)?;

        let config = self.args.registry_config();
        if config.skip_tls {
            self.logger
                .warning("TLS certificate verification is disabled");
        }
        let client = RegistryClient::new(config)
            .map_err(|err| Error::Validation(format!("cannot build HTTP client: {}", err)))?;

        match &self.args.command {
            Command::List(args) => self.list(client, args).await,
            Command::Copy(args) => self.copy(client, args).await,
            Command::Pull(args) => self.pull(client, args).await,
            Command::Push(args) => self.push(client, args).await,
        }
    }

    async fn credentials(&self, namespace: &str, secret: &str) -> Result<AuthContext> {
        if secret.is_empty() {
            self.logger.verbose("No secret given, using anonymous access");
        } else {
            self.logger
                .verbose(&format!("Reading credentials from secret {}/{}", namespace, secret));
        }
        Ok(self.resolver.resolve(namespace, secret).await?)
    }

    async fn list(&self, client: RegistryClient, args: &ListArgs) -> Result<()> {
        let auth = self.credentials(&args.namespace, &args.secret).await?;
        self.logger.verbose(&format!("Listing tags of {}", args.image));

        let tags = TagResolver::new(client)
            .list_tags(&args.image, &args.filter, auth, args.limit)
            .await?;
        if tags.is_empty() {
            self.logger
                .warning(&format!("No tags of {} match '{}'", args.image, args.filter));
        }
        for tag in &tags {
            self.logger.output(tag);
        }
        Ok(())
    }

    async fn copy(&self, client: RegistryClient, args: &CopyArgs) -> Result<()> {
        self.logger.section("Copy");
        let source_auth = self
            .credentials(&args.source_namespace, &args.source_secret)
            .await?;
        let dest_auth = self
            .credentials(&args.dest_namespace, &args.dest_secret)
            .await?;

        self.logger
            .step(&format!("Copying {} to {}", args.source, args.destination));
        let (sink, renderer) = self.progress(args.progress);
        let result = Transferer::new(client)
            .copy(&args.source, &args.destination, source_auth, dest_auth, sink)
            .await;
        self.finish_progress(renderer).await;
        result?;

        self.logger.success(&format!(
            "Copied {} to {} in {}",
            args.source,
            args.destination,
            self.logger.format_duration(self.logger.elapsed())
        ));
        Ok(())
    }

    async fn pull(&self, client: RegistryClient, args: &PullArgs) -> Result<()> {
        self.logger.section("Pull");
        let platform = Platform::parse(&args.platform)?;
        let auth = self.credentials(&args.namespace, &args.secret).await?;

        self.logger.step(&format!(
            "Saving {} ({}) to {}",
            args.image,
            platform,
            args.output.display()
        ));
        let summary = ImageArchiver::new(client)
            .pull(&args.image, &args.output, auth, &platform)
            .await?;

        self.logger.info(&format!(
            "Manifest digest: {}",
            DigestUtils::format_digest_short(&summary.digest)
        ));
        self.logger.success(&format!(
            "Saved {} ({} layers, {}) to {}",
            summary.reference,
            summary.layers,
            self.logger.format_size(summary.size),
            args.output.display()
        ));
        Ok(())
    }

    async fn push(&self, client: RegistryClient, args: &PushArgs) -> Result<()> {
        self.logger.section("Push");
        let auth = self.credentials(&args.namespace, &args.secret).await?;

        self.logger.step(&format!(
            "Uploading {} as {}",
            args.source.display(),
            args.image
        ));
        let (sink, renderer) = self.progress(args.progress);
        let result = ImageArchiver::new(client)
            .push(&args.image, &args.source, auth, sink)
            .await;
        self.finish_progress(renderer).await;
        let summary = result?;

        self.logger.info(&format!(
            "Manifest digest: {}",
            DigestUtils::format_digest_short(&summary.digest)
        ));
        self.logger.success(&format!(
            "Pushed {} ({} layers, {}) in {}",
            summary.reference,
            summary.layers,
            self.logger.format_size(summary.size),
            self.logger.format_duration(self.logger.elapsed())
        ));
        Ok(())
    }

    /// Start a renderer task draining the progress channel
    fn progress(&self, enabled: bool) -> (Option<ProgressSink>, Option<JoinHandle<()>>) {
        if !enabled {
            return (None, None);
        }
        let (sink, receiver) = progress_channel(PROGRESS_QUEUE_CAPACITY);
        let handle = tokio::spawn(render_progress(self.logger.clone(), receiver));
        (Some(sink), Some(handle))
    }

    async fn finish_progress(&self, renderer: Option<JoinHandle<()>>) {
        if let Some(handle) = renderer {
            if handle.await.is_err() {
                self.logger.warning("progress display stopped unexpectedly");
            }
            self.logger.progress_done();
        }
    }
}

async fn render_progress(logger: Logger, mut receiver: ProgressReceiver) {
    while let Some(update) = receiver.recv().await {
        logger.transfer_progress(&update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_runner_takes_verbosity_from_args() {
        let args = Args::try_parse_from(["repo-lister", "list", "-i", "nginx", "-v", "-q"]).unwrap();
        let runner = Runner::new(args);
        assert!(runner.logger().quiet);
        assert!(!runner.logger().verbose);
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_arguments_before_any_io() {
        let args = Args::try_parse_from([
            "repo-lister",
            "push",
            "-i",
            "localhost:5000/app:1.0",
            "-f",
            "/nonexistent/app.tar",
        ])
        .unwrap();
        let err = Runner::new(args).run().await.unwrap_err();
        assert!(matches!(err, Error::Validation(ref reason) if reason.contains("/nonexistent/app.tar")));
    }
}
