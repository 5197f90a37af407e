//! Async subprocess execution.
//!
//! Thin wrapper over [`tokio::process::Command`] that always captures stdout
//! and stderr so callers can inspect failures without re-running anything.

use tokio::process::Command;

/// A subprocess invocation, not yet spawned.
#[derive(Debug, Clone)]
pub struct SubprocessSpec {
	/// Argument vector; `argv[0]` is the program to run.
	pub argv: Vec<String>,
}

impl SubprocessSpec {
	/// Build a spec from a program and its arguments.
	#[must_use]
	pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
		let mut argv = vec![program.into()];
		argv.extend(args.into_iter().map(Into::into));
		Self { argv }
	}
}

/// Captured result of running a [`SubprocessSpec`] to completion.
#[derive(Debug)]
pub struct SubprocessOutput {
	/// Captured standard output.
	pub stdout: Vec<u8>,
	/// Captured standard error.
	pub stderr: Vec<u8>,
	/// Process exit status.
	pub status: std::process::ExitStatus,
}

impl SubprocessOutput {
	/// True if the process exited with status zero.
	#[must_use]
	pub fn success(&self) -> bool {
		self.status.success()
	}
}

/// Spawn `spec` and await its completion, capturing stdout/stderr.
///
/// # Errors
///
/// Returns an error if the process cannot be spawned (missing binary,
/// permission denied) or if waiting on it fails.
pub async fn run(spec: &SubprocessSpec) -> std::io::Result<SubprocessOutput> {
	let (program, args) = spec
		.argv
		.split_first()
		.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"))?;

	let output = Command::new(program)
		.args(args)
		.stdin(std::process::Stdio::null())
		.stdout(std::process::Stdio::piped())
		.stderr(std::process::Stdio::piped())
		.kill_on_drop(true)
		.output()
		.await?;

	Ok(SubprocessOutput {
		stdout: output.stdout,
		stderr: output.stderr,
		status: output.status,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn captures_stdout_and_exit_status() {
		let spec = SubprocessSpec::new("echo", ["hello"]);
		let out = run(&spec).await.unwrap();
		assert!(out.success());
		assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hello");
	}

	#[tokio::test]
	async fn captures_nonzero_exit() {
		let spec = SubprocessSpec::new("false", Vec::<String>::new());
		let out = run(&spec).await.unwrap();
		assert!(!out.success());
	}

	#[tokio::test]
	async fn rejects_empty_argv() {
		let spec = SubprocessSpec { argv: Vec::new() };
		assert!(run(&spec).await.is_err());
	}
}
