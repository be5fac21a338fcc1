use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, util::TryInitError, EnvFilter};

use super::config::LoggingConfig;

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured directive. Logs go to stderr, keeping stdout free for command output.
/// Fails if a global subscriber is already set.
pub fn init(config: &LoggingConfig) -> Result<(), TryInitError> {
	let filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(&config.directive))
		.unwrap_or_else(|e| {
			eprintln!(
				"Invalid tracing directive '{}', falling back to 'info': {e}",
				config.directive
			);
			EnvFilter::new("info")
		});

	tracing_subscriber::registry()
		.with(filter)
		.with(
			fmt::layer()
				.with_writer(std::io::stderr)
				.with_file(config.with_file_and_line)
				.with_line_number(config.with_file_and_line),
		)
		.try_init()?;

	debug!(directive = %config.directive, "Logging initialized");

	Ok(())
}
