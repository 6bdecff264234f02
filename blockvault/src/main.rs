mod logging;

use anyhow::{Context, Result, anyhow};
use blockvault_core::backup::{BackupEngine, PreflightReport};
use blockvault_core::backup_set::BackupSet;
use blockvault_core::config::{Config, Overrides};
use blockvault_core::device::{BackupMode, Device};
use blockvault_core::platform::{Host, LinuxHost};
use blockvault_core::progress::{Progress, Stage};
use blockvault_core::resolve::{DeviceResolver, Resolve};
use blockvault_core::restore::{CONFIRMATION_PHRASE, RestoreEngine};
use blockvault_core::verify::Verifier;
use blockvault_core::{Error as CoreError, raw};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Input, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::cell::RefCell;
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

use crate::logging::LogConfig;

#[derive(Parser)]
#[command(name = "blockvault")]
#[command(about = "Partition-aware block device backup and restore", version)]
struct Cli {
    /// Settings file (default: /etc/blockvault.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write a detailed log to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit console logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check privileges and tools, and show how each partition would be captured
    Preflight {
        /// Disk to inspect (default: first non-removable disk)
        #[arg(short, long)]
        device: Option<String>,

        /// Plan a single image of the whole device
        #[arg(long)]
        whole_disk: bool,
    },
    /// Back a disk up into a new backup set directory
    Backup {
        /// Disk to back up (default: first non-removable disk)
        #[arg(short, long)]
        device: Option<String>,

        /// Backup set directory; must not exist or be empty
        #[arg(required = true)]
        dest: PathBuf,

        /// Capture the whole device as one image
        #[arg(long)]
        whole_disk: bool,

        /// Image partitions even if they are mounted
        #[arg(long)]
        allow_mounted: bool,

        /// gzip level for generic images (0-9)
        #[arg(short = 'l', long)]
        compression_level: Option<u32>,

        /// Do not ask before starting
        #[arg(short, long)]
        yes: bool,
    },
    /// Restore a backup set onto a disk, destroying its contents
    Restore {
        /// Backup set directory
        #[arg(required = true)]
        backup: PathBuf,

        /// Target disk
        #[arg(short, long, required = true)]
        device: String,

        /// Skip the typed confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Re-validate a backup set, optionally against a live disk
    Verify {
        /// Backup set directory
        #[arg(required = true)]
        backup: PathBuf,

        /// Compare partition layout and filesystem types with this disk
        #[arg(short, long)]
        compare: Option<String>,
    },
    /// List disks
    List,
    /// Menu-driven mode
    Interactive,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        let mut overrides = Overrides {
            log_file: self.log_file.clone(),
            verbose: self.verbose.then_some(true),
            ..Default::default()
        };
        match &self.command {
            Commands::Backup {
                allow_mounted,
                compression_level,
                yes,
                ..
            } => {
                overrides.allow_mounted = allow_mounted.then_some(true);
                overrides.compression_level = *compression_level;
                overrides.assume_yes = yes.then_some(true);
            }
            Commands::Restore { yes, .. } => {
                overrides.assume_yes = yes.then_some(true);
            }
            _ => {}
        }
        overrides
    }
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// By disabling it, we can have a cleaner exit when the user cancels the
/// operation, as the `ctrlc` handler will print its own message.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                // Disable printing of control characters.
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            // Restore the original terminal settings.
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix:24} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("■ ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:24} [{elapsed_precise}] {spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Connects the engines' progress reports to indicatif bars: one line per
/// stage, one bar per image.
#[derive(Default)]
struct BarProgress {
    bar: RefCell<Option<ProgressBar>>,
}

impl BarProgress {
    fn abandon(&self) {
        if let Some(bar) = self.bar.borrow_mut().take() {
            bar.abandon_with_message("❌ Operation failed.");
        }
    }
}

impl Progress for BarProgress {
    fn stage(&self, stage: Stage) {
        if stage == Stage::Done {
            return;
        }
        println!("{} {}", style("==>").blue().bold(), stage);
    }

    fn transfer_start(&self, label: &str, total_bytes: u64) {
        let mut slot = self.bar.borrow_mut();
        if let Some(bar) = slot.as_ref() {
            if bar.prefix() == label {
                // The engine re-announces a transfer when it falls back to
                // another method; keep the same bar.
                bar.set_length(total_bytes);
                bar.set_position(0);
                return;
            }
            bar.finish_and_clear();
        }

        let bar = if total_bytes == 0 {
            let bar = ProgressBar::new_spinner().with_style(spinner_style());
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        } else {
            ProgressBar::new(total_bytes).with_style(bar_style())
        };
        bar.set_prefix(label.to_string());
        *slot = Some(bar);
    }

    fn transfer_progress(&self, bytes: u64) {
        if let Some(bar) = self.bar.borrow().as_ref() {
            bar.set_position(bytes);
        }
    }

    fn transfer_done(&self, label: &str, method: &str) {
        if let Some(bar) = self.bar.borrow_mut().take() {
            bar.finish_and_clear();
        }
        println!("    {} {label} via {}", style("✓").green(), style(method).cyan());
    }
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No disks found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn prompt_path(prompt: &str) -> Result<PathBuf> {
    let text: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .interact_text()?;
    Ok(PathBuf::from(text.trim()))
}

/// Asks for the typed confirmation phrase before a restore.
fn ask_phrase(prompt: &str) -> blockvault_core::Result<String> {
    println!("{} {prompt}", style("WARNING:").red().bold());
    Input::<String>::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Type {CONFIRMATION_PHRASE}"))
        .allow_empty(true)
        .interact_text()
        .map_err(|e| CoreError::io("/dev/tty", std::io::Error::other(e.to_string())))
}

fn mark(ok: bool) -> console::StyledObject<&'static str> {
    if ok {
        style("✓").green()
    } else {
        style("✗").red()
    }
}

struct App {
    config: Config,
    host: LinuxHost,
    running: Arc<AtomicBool>,
}

impl App {
    fn resolve(&self, identifier: Option<&str>) -> Result<PathBuf> {
        let device = DeviceResolver::new(&self.host).resolve_or_detect(identifier)?;
        info!(device = %device.display(), "Using device");
        Ok(device)
    }

    fn list(&self) -> Result<()> {
        let disks = self.host.list_disks()?;
        if disks.is_empty() {
            println!("No disks found.");
            return Ok(());
        }

        println!("Found {} disks:", disks.len());
        println!(
            "\n  {:<15} {:>11} {:<12} {:<24} {}",
            "DEVICE", "SIZE", "TYPE", "MODEL", "MOUNTED"
        );
        println!("  {:-<15} {:->11} {:-<12} {:-<24} {:-<20}", "", "", "", "", "");
        for disk in disks {
            let mounts: Vec<String> = self
                .host
                .list_partitions(&disk.path)
                .unwrap_or_default()
                .iter()
                .filter_map(|p| self.host.mount_point(&p.path))
                .map(|m| m.display().to_string())
                .collect();
            let location = if mounts.is_empty() {
                "(Not mounted)".to_string()
            } else {
                mounts.join(", ")
            };
            let kind = if disk.removable { "Removable" } else { "Fixed" };
            println!(
                "  {:<15} {:>8.1} GB {:<12} {:<24} {}",
                disk.path.display(),
                disk.size_gb(),
                kind,
                disk.model,
                location
            );
        }
        Ok(())
    }

    fn print_preflight(&self, report: &PreflightReport) {
        println!("Preflight for {} ({} mode)", style(report.device.display()).cyan(), report.mode);
        println!("  {} root privileges", mark(report.privileged));
        for tool in &report.required_tools {
            println!("  {} {}", mark(tool.present), tool.name);
        }
        println!("  {} gzip codec (built-in)", mark(report.codec_ok));
        println!(
            "  {} sfdisk (table dump; raw head/tail is always saved)",
            mark(report.table_tool)
        );
        if report.mode == BackupMode::WholeDisk {
            println!("\n  Whole device captured as one gzip image.");
            return;
        }
        println!("\n  {:<4} {:<18} {:<10} {}", "#", "PARTITION", "FSTYPE", "METHOD");
        for planned in &report.plan {
            let p = &planned.partition;
            let method = planned.intended();
            let note = if planned.available || method == planned.capability {
                String::new()
            } else {
                format!(" ({} not installed)", planned.capability)
            };
            println!(
                "  {:<4} {:<18} {:<10} {}{}",
                p.number,
                p.path.display(),
                p.fs_type,
                style(method).cyan(),
                note
            );
        }
    }

    fn preflight(&self, device: Option<&str>, mode: BackupMode) -> Result<()> {
        let device = self.resolve(device)?;
        let report = BackupEngine::new(&self.config, &self.host).preflight(&device, mode)?;
        self.print_preflight(&report);
        report.ensure_ready(self.config.require_root)?;
        println!("\n{} Ready to back up.", mark(true));
        Ok(())
    }

    fn backup(&self, device: Option<&str>, dest: &Path, mode: BackupMode) -> Result<()> {
        let device = self.resolve(device)?;
        let size = raw::device_size(&device)?;
        println!(
            "This will back up {:.1} GB from '{}'.",
            size as f64 / (1024.0 * 1024.0 * 1024.0),
            device.display()
        );
        println!("  Device: {}", style(device.display()).cyan());
        println!("  Output: {}", style(dest.display()).cyan());
        println!("  Mode:   {mode}");
        println!();

        if !self.config.assume_yes && !confirm_operation("Are you sure you want to proceed?")? {
            println!("Backup cancelled.");
            return Ok(());
        }

        let progress = BarProgress::default();
        let result = BackupEngine::new(&self.config, &self.host)
            .with_progress(&progress)
            .with_running(&self.running)
            .run(&device, dest, mode);

        match result {
            Ok(summary) => {
                println!(
                    "\n✨ Backed up {} to {} ({} images, audit passed).",
                    style(device.display()).cyan(),
                    style(summary.dir.display()).cyan(),
                    summary.entries.len()
                );
                Ok(())
            }
            Err(e) => {
                progress.abandon();
                Err(e.into())
            }
        }
    }

    fn restore(&self, backup: &Path, device: &str) -> Result<()> {
        let device = self.resolve(Some(device))?;
        println!("  Backup: {}", style(backup.display()).cyan());
        println!("  Target: {}", style(device.display()).cyan());
        println!();

        let progress = BarProgress::default();
        let result = RestoreEngine::new(&self.config, &self.host, &ask_phrase)
            .with_progress(&progress)
            .with_running(&self.running)
            .run(backup, &device);

        match result {
            Ok(summary) => {
                println!(
                    "\n✨ Restored {} images onto {}.",
                    summary.restored.len(),
                    style(summary.device.display()).cyan()
                );
                Ok(())
            }
            Err(e) => {
                progress.abandon();
                Err(e.into())
            }
        }
    }

    fn verify(&self, backup: &Path, compare: Option<&str>) -> Result<()> {
        let set = BackupSet::open(backup)?;
        let compare = compare.map(|c| self.resolve(Some(c))).transpose()?;
        Verifier::new(&self.host).verify(&set, compare.as_deref())?;
        println!(
            "{} {} is valid ({} mode, {} images{}).",
            mark(true),
            style(backup.display()).cyan(),
            set.mode(),
            set.manifest.len(),
            compare
                .map(|d| format!(", matches {}", d.display()))
                .unwrap_or_default()
        );
        Ok(())
    }

    fn interactive(&self) -> Result<()> {
        let actions = [
            "Preflight",
            "Back up a disk",
            "Restore a backup",
            "Verify a backup",
            "List disks",
            "Quit",
        ];
        loop {
            let choice = Select::with_theme(&ColorfulTheme::default())
                .with_prompt("What do you want to do?")
                .items(&actions)
                .default(0)
                .interact()?;

            let outcome = match choice {
                0 => self
                    .pick_disk("Select the disk to inspect")
                    .and_then(|d| self.preflight(Some(&d), BackupMode::Partitioned)),
                1 => self.interactive_backup(),
                2 => self.interactive_restore(),
                3 => prompt_path("Backup set directory").and_then(|b| self.verify(&b, None)),
                4 => self.list(),
                _ => return Ok(()),
            };
            match outcome {
                Err(e) if is_declined(&e) => report_cancelled(),
                Err(e) => report_error(&e, self.config.log_file.as_deref()),
                Ok(()) => {}
            }
            println!();
        }
    }

    fn pick_disk(&self, prompt: &str) -> Result<String> {
        let disks = self.host.list_disks()?;
        Ok(select_device(&disks, prompt)?.path.display().to_string())
    }

    fn interactive_backup(&self) -> Result<()> {
        let device = self.pick_disk("Select the source disk to BACK UP")?;
        let dest = prompt_path("Backup set directory")?;
        let modes = ["Per partition", "Whole disk"];
        let mode = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Backup mode")
            .items(&modes)
            .default(0)
            .interact()?;
        let mode = if mode == 0 {
            BackupMode::Partitioned
        } else {
            BackupMode::WholeDisk
        };
        self.backup(Some(&device), &dest, mode)
    }

    fn interactive_restore(&self) -> Result<()> {
        let backup = prompt_path("Backup set directory")?;
        let device = self.pick_disk("Select the target disk to RESTORE onto")?;
        self.restore(&backup, &device)
    }
}

/// A declined restore prompt is a clean cancel, not a failure.
fn is_declined(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<CoreError>(),
        Some(CoreError::ConfirmationDeclined)
    )
}

fn report_cancelled() {
    println!("Restore cancelled; the target was not modified.");
}

/// Prints the one-line diagnostic for a failed command.
fn report_error(e: &anyhow::Error, log_file: Option<&Path>) {
    eprintln!("{} {e:#}", style("error:").red().bold());
    if let Some(path) = log_file {
        eprintln!("       details in {}", path.display());
    }
}

fn run(cli: Cli, running: Arc<AtomicBool>) -> Result<()> {
    let config = Config::load(cli.config.as_deref(), &cli.overrides())?;
    logging::init(&LogConfig {
        json: cli.json_logs,
        verbose: config.verbose,
        file: config.log_file.clone(),
    })
    .context("could not open log file")?;

    let app = App {
        config,
        host: LinuxHost,
        running,
    };

    match cli.command {
        Commands::Preflight { device, whole_disk } => {
            let mode = if whole_disk {
                BackupMode::WholeDisk
            } else {
                BackupMode::Partitioned
            };
            app.preflight(device.as_deref(), mode)
        }
        Commands::Backup {
            device,
            dest,
            whole_disk,
            ..
        } => {
            let mode = if whole_disk {
                BackupMode::WholeDisk
            } else {
                BackupMode::Partitioned
            };
            app.backup(device.as_deref(), &dest, mode)
        }
        Commands::Restore { backup, device, .. } => app.restore(&backup, &device),
        Commands::Verify { backup, compare } => app.verify(&backup, compare.as_deref()),
        Commands::List => app.list(),
        Commands::Interactive => app.interactive(),
    }
}

fn main() -> ExitCode {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // This flag allows for graceful cancellation of operations.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Set up the Ctrl+C handler to toggle the `running` flag.
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
        eprintln!("\nInterrupt received, stopping after the current buffer...");
    }) {
        eprintln!("{} {e}", style("error:").red().bold());
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();
    let log_file = cli.log_file.clone();

    match run(cli, running) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if is_declined(&e) {
                report_cancelled();
                return ExitCode::SUCCESS;
            }
            report_error(&e, log_file.as_deref());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declined_confirmation_is_a_cancel() {
        assert!(is_declined(&anyhow::Error::from(CoreError::ConfirmationDeclined)));
        assert!(is_declined(
            &anyhow::Error::from(CoreError::ConfirmationDeclined).context("restore")
        ));
        assert!(!is_declined(&anyhow::Error::from(CoreError::Cancelled)));
        assert!(!is_declined(&anyhow!("something else")));
    }
}
