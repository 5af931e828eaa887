use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use chunkfs::config::{Cli, Command, MountConfig};
use chunkfs::error::UnmountError;
use chunkfs::fs::FuseRegistrar;
use chunkfs::mount::{Collaborators, MountManager, MountSession};
use chunkfs::store::codec::Sha256Codec;
use chunkfs::store::dir::{DirChunkStore, JsonMetadataStore};
use chunkfs::store::RetryPolicy;
use chunkfs::tree::path::CaseSensitivity;

/// Write-end of the self-pipe used for signal notification.
static SIGNAL_PIPE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn signal_handler(_sig: libc::c_int) {
    let fd = SIGNAL_PIPE.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::write(fd, [0u8].as_ptr() as *const libc::c_void, 1);
        }
    }
}

enum ShutdownAction {
    /// Second signal — force unmount.
    ForceUnmount,
    /// FUSE session ended on its own, or first-signal probe unmount succeeded.
    ExternalUnmount,
}

/// Attempt a regular (non-forced) unmount. Returns true if the mount was
/// successfully removed — i.e. the mount was not busy.
fn try_unmount(mountpoint: &Path) -> bool {
    std::process::Command::new("umount")
        .arg(mountpoint)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn report_busy(session: &MountSession) {
    let open_files = session.open_files();
    if open_files.is_empty() {
        eprintln!("chunkfs: mount is busy — processes are using the mountpoint");
        return;
    }
    eprintln!("chunkfs: mount is busy — {} open file(s):", open_files.len());
    let display_cap = 10;
    for info in open_files.iter().take(display_cap) {
        eprintln!(
            "  {}  (SID {}, {} unflushed bytes)",
            info.path, info.sid, info.dirty_bytes
        );
    }
    if open_files.len() > display_cap {
        eprintln!("  and {} more...", open_files.len() - display_cap);
    }
}

/// Block until shutdown conditions are met. Implements two-phase ctrl-C:
/// - First signal when mount is not busy: immediate clean unmount.
/// - First signal when mount is busy (open handles, CWD, etc.): warn and wait.
/// - Second signal: force unmount.
/// - FUSE session exits on its own: external unmount.
fn wait_for_shutdown(session: &MountSession, mountpoint: &Path) -> std::io::Result<ShutdownAction> {
    let mut pipe_fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    SIGNAL_PIPE.store(pipe_fds[1], Ordering::Relaxed);

    unsafe {
        use nix::sys::signal::{signal, SigHandler, Signal};
        signal(Signal::SIGINT, SigHandler::Handler(signal_handler)).ok();
        signal(Signal::SIGTERM, SigHandler::Handler(signal_handler)).ok();
    }

    let mut first_signal_received = false;
    let mut poll_ticks: u32 = 0;

    let action = loop {
        let mut pfd = libc::pollfd {
            fd: pipe_fds[0],
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 200) }; // 200 ms timeout

        if ret > 0 {
            let mut buf = [0u8; 1];
            unsafe {
                libc::read(pipe_fds[0], buf.as_mut_ptr() as *mut libc::c_void, 1);
            }

            if first_signal_received {
                eprintln!("chunkfs: force unmounting...");
                break ShutdownAction::ForceUnmount;
            }

            if !session.is_registered() {
                break ShutdownAction::ExternalUnmount;
            }

            if try_unmount(mountpoint) {
                eprintln!("chunkfs: unmounting (received signal)...");
                break ShutdownAction::ExternalUnmount;
            }

            first_signal_received = true;
            report_busy(session);
            eprintln!(
                "Close open files to unmount cleanly, or press ctrl-C again to force unmount."
            );
            continue;
        }

        if !session.is_registered() {
            break ShutdownAction::ExternalUnmount;
        }

        if first_signal_received {
            poll_ticks += 1;
            // Probe every ~1 second (5 ticks * 200ms).
            if poll_ticks % 5 == 0 && try_unmount(mountpoint) {
                eprintln!("chunkfs: all clear, unmounting...");
                break ShutdownAction::ExternalUnmount;
            }
        }
    };

    SIGNAL_PIPE.store(-1, Ordering::Relaxed);
    unsafe {
        libc::close(pipe_fds[0]);
        libc::close(pipe_fds[1]);
    }

    Ok(action)
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Mount {
            store,
            mountpoint,
            session_id,
            log_file,
            cache_mb,
            chunk_kb,
            case_insensitive,
            backslash_separators,
            flush_timeout_secs,
            retry_attempts,
            retry_backoff_ms,
            foreground: _,
        } => {
            if let Err(e) = std::fs::create_dir_all(&store) {
                eprintln!("Error creating store directory {:?}: {}", store, e);
                std::process::exit(1);
            }
            let store = std::fs::canonicalize(&store).unwrap_or_else(|e| {
                eprintln!("Error: store directory {:?}: {}", store, e);
                std::process::exit(1);
            });

            // Create mountpoint if it doesn't exist
            if !mountpoint.exists() {
                if let Err(e) = std::fs::create_dir_all(&mountpoint) {
                    eprintln!("Error creating mountpoint {:?}: {}", mountpoint, e);
                    std::process::exit(1);
                }
            }

            let mountpoint = std::fs::canonicalize(&mountpoint).unwrap_or_else(|e| {
                eprintln!("Error: mountpoint {:?}: {}", mountpoint, e);
                std::process::exit(1);
            });

            // A stale FUSE mount left behind by a crash or forced kill is not
            // cleaned up automatically on every platform.
            if is_stale_fuse_mount(&mountpoint) {
                eprintln!(
                    "Error: {} is a stale FUSE mount (previous chunkfs session didn't clean up).\n\
                     Fix with:  umount -f {}",
                    mountpoint.display(),
                    mountpoint.display(),
                );
                std::process::exit(1);
            }

            let sid = session_id.unwrap_or_else(|| format!("chunkfs-{}", std::process::id()));

            // Set up logging
            let log_dir = log_file.parent().unwrap_or_else(|| Path::new("/tmp"));
            let log_name = log_file
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("chunkfs.log"));
            let file_appender = tracing_appender::rolling::never(log_dir, log_name);
            let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

            let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(false),
                )
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(false),
                );
            if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Error: failed to set tracing subscriber: {}", e);
                std::process::exit(1);
            }

            let config = MountConfig {
                session_id: sid.clone(),
                case_sensitivity: if case_insensitive {
                    CaseSensitivity::Insensitive
                } else {
                    CaseSensitivity::Sensitive
                },
                accept_backslash: backslash_separators,
                cache_budget_bytes: cache_mb.saturating_mul(1024 * 1024),
                flush_timeout: Duration::from_secs(flush_timeout_secs),
                retry: RetryPolicy {
                    attempts: retry_attempts.max(1),
                    initial_backoff: Duration::from_millis(retry_backoff_ms),
                    ..RetryPolicy::default()
                },
                chunk_size: chunk_kb.max(1).saturating_mul(1024),
            };

            let chunks = match DirChunkStore::open(store.join("chunks")) {
                Ok(chunks) => chunks,
                Err(e) => {
                    error!("Failed to open chunk store: {}", e);
                    std::process::exit(1);
                }
            };
            let collab = Collaborators {
                store: Arc::new(chunks),
                codec: Arc::new(Sha256Codec::new(config.chunk_size)),
                meta: Arc::new(JsonMetadataStore::new(store.join("metadata.json"))),
            };

            info!(
                "chunkfs starting: session={}, store={}, mountpoint={}",
                sid,
                store.display(),
                mountpoint.display()
            );

            let flush_timeout = config.flush_timeout;
            let target = mountpoint.to_string_lossy().into_owned();
            let manager = MountManager::new(FuseRegistrar);
            let session = match manager.mount(&target, config, collab) {
                Ok(session) => session,
                Err(e) => {
                    error!("Failed to mount: {}", e);
                    std::process::exit(1);
                }
            };

            info!("chunkfs mounted at {}", mountpoint.display());

            let action = match wait_for_shutdown(&session, &mountpoint) {
                Ok(action) => action,
                Err(e) => {
                    error!("Failed to install signal handling: {}", e);
                    ShutdownAction::ForceUnmount
                }
            };
            drop(session);

            // The filesystem state lives in this process, so uncommitted data
            // is still flushed after the kernel side is gone.
            let mut attempts_left = 3;
            loop {
                match manager.unmount(&target, flush_timeout) {
                    Ok(()) => break,
                    Err(UnmountError::Busy) if attempts_left > 1 => {
                        attempts_left -= 1;
                        error!("Unmount busy: uncommitted data remains; retrying");
                    }
                    Err(e) => {
                        error!("Unmount failed: {}", e);
                        if matches!(action, ShutdownAction::ForceUnmount) {
                            match std::process::Command::new("umount")
                                .args(["-f", &*target])
                                .status()
                            {
                                Ok(status) if status.success() => {
                                    info!("force unmounted {}", target)
                                }
                                Ok(status) => error!("umount -f {} exited with {}", target, status),
                                Err(e) => error!("umount -f {} failed: {}", target, e),
                            }
                        }
                        std::process::exit(1);
                    }
                }
            }

            eprintln!("chunkfs: unmounted {}", mountpoint.display());
        }
        Command::Unmount { mountpoint } => {
            unmount(&mountpoint);
        }
    }
}

/// Check if `path` is a stale FUSE mount: it appears in `mount` output as a
/// fuse/macfuse volume but is no longer functional (readdir fails).
fn is_stale_fuse_mount(path: &Path) -> bool {
    let output = match std::process::Command::new("mount").output() {
        Ok(o) => o,
        Err(_) => return false,
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    let path_str = path.to_string_lossy();
    let is_fuse_mount = stdout.lines().any(|line| {
        line.contains(path_str.as_ref()) && (line.contains("fuse") || line.contains("macfuse"))
    });
    if !is_fuse_mount {
        return false;
    }
    std::fs::read_dir(path).is_err()
}

fn unmount(mountpoint: &PathBuf) {
    let mountpoint = std::fs::canonicalize(mountpoint).unwrap_or_else(|e| {
        eprintln!("Error: mountpoint {:?}: {}", mountpoint, e);
        std::process::exit(1);
    });
    let mp = mountpoint.to_string_lossy();
    eprintln!("Unmounting {}...", mp);

    // Try umount first
    let output = std::process::Command::new("umount").arg(&*mp).output();

    if matches!(&output, Ok(o) if o.status.success()) {
        eprintln!("Successfully unmounted {}", mp);
        return;
    }

    if let Ok(ref o) = output {
        let stderr = String::from_utf8_lossy(&o.stderr);
        if stderr.contains("busy") {
            eprintln!(
                "Mount point is busy. Make sure no shells or processes are using {}, then try again.",
                mp
            );
            std::process::exit(1);
        }
    }

    // Try fusermount (Linux, unprivileged mounts)
    let output = std::process::Command::new("fusermount")
        .args(["-u", &*mp])
        .output();

    if matches!(&output, Ok(o) if o.status.success()) {
        eprintln!("Successfully unmounted {}", mp);
        return;
    }

    // Try diskutil unmount (macOS)
    let output = std::process::Command::new("diskutil")
        .args(["unmount", &*mp])
        .output();

    if matches!(&output, Ok(o) if o.status.success()) {
        eprintln!("Successfully unmounted {}", mp);
        return;
    }

    if let Ok(ref o) = output {
        let stderr = String::from_utf8_lossy(&o.stderr);
        let stdout = String::from_utf8_lossy(&o.stdout);
        if stderr.contains("busy") || stdout.contains("busy") {
            eprintln!(
                "Mount point is busy. Make sure no shells or processes are using {}, then try again.",
                mp
            );
            std::process::exit(1);
        }
    }

    // Force unmount as last resort
    let status = std::process::Command::new("umount")
        .args(["-f", &*mp])
        .status();

    if matches!(status, Ok(s) if s.success()) {
        eprintln!("Successfully unmounted {} (forced)", mp);
        return;
    }

    eprintln!("Failed to unmount {}. Try: sudo umount -f {}", mp, mp);
    std::process::exit(1);
}
