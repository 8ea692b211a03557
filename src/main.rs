use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use robocurse::audit::{AuditEvent, AuditLog, OperationalLogLayer};
use robocurse::checkpoint::{Checkpoint, CheckpointStore};
use robocurse::cli::args::Cli;
use robocurse::config::{self, ProfileConfig, Settings, Verbosity};
use robocurse::copyjob::{CopyOptions, CopyTool, ExternalCopyTool, Job};
use robocurse::error::RobocurseError;
use robocurse::locks::ProfileLock;
use robocurse::model::chunk::{self, Chunk, ChunkCaps};
use robocurse::model::path::CanonicalPath;
use robocurse::model::tree;
use robocurse::orchestrator::{OrchestrationState, Phase, TickContext};
use robocurse::snapshot::{NoSnapshotProvider, SnapshotCoordinator};

const TICK_INTERVAL: Duration = Duration::from_millis(200);

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            display_error(&err);
            2
        }
    };
    std::process::exit(exit_code);
}

/// Overall run outcome for a single profile, folded into the process exit
/// code once every selected profile has had its turn.
struct ProfileOutcome {
    phase: Phase,
    failed_chunks: usize,
}

async fn run(cli: Cli) -> Result<i32, RobocurseError> {
    config::validate_config_path(&cli.config)?;
    let config_path = PathBuf::from(&cli.config);
    let parsed = config::load_config(&config_path)?;
    let settings = parsed.settings.clone();

    let profiles = select_profiles(&cli, &parsed.profiles)?;

    let log_root = match &settings.log_root {
        Some(root) => PathBuf::from(root),
        None => config::paths::robocurse_log_dir()?,
    };
    let lock_dir = log_root.join(".locks");
    let checkpoint_store = CheckpointStore::new(log_root.join("checkpoints"));
    let snapshot_coordinator = SnapshotCoordinator::new(NoSnapshotProvider, log_root.join("snapshot-tracking.json"));
    snapshot_coordinator.reclaim_orphans();

    let session_id = uuid::Uuid::new_v4().to_string();
    let audit = Arc::new(AuditLog::new(log_root.clone(), session_id.clone()));

    let verbosity = Verbosity::from((cli.quiet, cli.verbose));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity.as_tracing_filter()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(OperationalLogLayer::new(audit.clone()))
        .init();

    audit.write_audit(AuditEvent::SessionStart {
        session_id: session_id.clone(),
    });

    let max_concurrent_jobs = cli.max_concurrent.unwrap_or(settings.max_concurrent_jobs);
    let copy_tool: Arc<dyn CopyTool> = Arc::new(ExternalCopyTool {
        program: settings.copy_tool_program.clone(),
    });

    let session_stop = Arc::new(AtomicBool::new(false));
    {
        let session_stop = session_stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                session_stop.store(true, Ordering::SeqCst);
            }
        });
    }

    let mut any_failed_chunks = false;
    let mut any_profile_unsuccessful = false;

    for (profile_index, profile) in profiles.iter().enumerate() {
        if session_stop.load(Ordering::SeqCst) {
            tracing::warn!("stop requested, skipping remaining profiles");
            any_profile_unsuccessful = true;
            break;
        }

        tracing::info!(profile = %profile.name, "starting profile");
        audit.write_audit(AuditEvent::ProfileStart {
            profile: profile.name.clone(),
        });

        let lock = ProfileLock::register(&lock_dir, &profile.name)?;
        let Some(lock) = lock else {
            tracing::warn!(profile = %profile.name, "another process already holds this profile's lock, skipping");
            audit.write_audit(AuditEvent::GeneralError {
                message: format!("profile '{}' is locked by another process", profile.name),
            });
            any_profile_unsuccessful = true;
            continue;
        };

        let outcome = run_one_profile(
            profile,
            profile_index as u32,
            &session_id,
            &settings,
            max_concurrent_jobs,
            cli.dry_run,
            &checkpoint_store,
            &snapshot_coordinator,
            copy_tool.as_ref(),
            &audit,
            &session_stop,
        )
        .await;

        lock.unregister();

        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                tracing::error!(profile = %profile.name, error = %e, "profile failed before planning completed");
                audit.write_audit(AuditEvent::GeneralError {
                    message: format!("profile '{}': {}", profile.name, e),
                });
                any_profile_unsuccessful = true;
                continue;
            }
        };

        audit.write_audit(AuditEvent::ProfileEnd {
            profile: profile.name.clone(),
            completed: (outcome.phase == Phase::Complete) as u64,
            failed: outcome.failed_chunks as u64,
        });

        if outcome.failed_chunks > 0 {
            any_failed_chunks = true;
        }
        if matches!(outcome.phase, Phase::Stopped | Phase::Failed) {
            any_profile_unsuccessful = true;
        }
    }

    if let Err(e) = robocurse::audit::rotate(&log_root, settings.compress_after_days, settings.delete_after_days) {
        tracing::warn!("log rotation failed: {e}");
    }

    let exit_code = if any_failed_chunks || any_profile_unsuccessful { 1 } else { 0 };
    audit.write_audit(AuditEvent::SessionEnd {
        session_id,
        exit_code,
    });

    Ok(exit_code)
}

/// Resolves the list of profiles a run should touch, in config order.
/// Neither `--profile` nor `--all-profiles` given is a usage error; clap's
/// `conflicts_with` only rules out both at once.
fn select_profiles<'a>(cli: &Cli, all: &'a [ProfileConfig]) -> Result<Vec<&'a ProfileConfig>, RobocurseError> {
    if let Some(name) = &cli.profile {
        let found = all.iter().find(|p| &p.name == name).ok_or_else(|| RobocurseError::ConfigInvalid {
            field: "profile".to_string(),
            reason: format!("no profile named '{}' in config", name),
        })?;
        return Ok(vec![found]);
    }
    if cli.all_profiles {
        return Ok(all.iter().filter(|p| p.enabled).collect());
    }
    Err(RobocurseError::ConfigInvalid {
        field: "profile selection".to_string(),
        reason: "specify either --profile <name> or --all-profiles".to_string(),
    })
}

fn resolve_source(raw: &str) -> Result<CanonicalPath, RobocurseError> {
    let canon = std::fs::canonicalize(raw).map_err(|e| RobocurseError::SourceUnavailable {
        path: PathBuf::from(raw),
        reason: e.to_string(),
    })?;
    CanonicalPath::new(&canon)
}

fn resolve_destination(raw: &str) -> Result<CanonicalPath, RobocurseError> {
    let path = PathBuf::from(raw);
    std::fs::create_dir_all(&path).map_err(|e| RobocurseError::SourceUnavailable {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    let canon = std::fs::canonicalize(&path).map_err(|e| RobocurseError::SourceUnavailable {
        path,
        reason: e.to_string(),
    })?;
    CanonicalPath::new(&canon)
}

#[allow(clippy::too_many_arguments)]
async fn run_one_profile(
    profile: &ProfileConfig,
    profile_index: u32,
    session_id: &str,
    settings: &Settings,
    max_concurrent_jobs: usize,
    dry_run: bool,
    checkpoint_store: &CheckpointStore,
    snapshot_coordinator: &SnapshotCoordinator<NoSnapshotProvider>,
    copy_tool: &dyn CopyTool,
    audit: &Arc<AuditLog>,
    session_stop: &Arc<AtomicBool>,
) -> Result<ProfileOutcome, RobocurseError> {
    let destination = resolve_destination(&profile.destination)?;

    if profile.use_snapshot {
        let source = resolve_source(&profile.source)?;
        let profile = profile.clone();
        let session_id = session_id.to_string();
        let settings = settings.clone();
        let audit = audit.clone();
        let session_stop = session_stop.clone();
        snapshot_coordinator
            .with_snapshot(&source, move |access_path| async move {
                execute_profile(
                    &profile,
                    profile_index,
                    &session_id,
                    &settings,
                    max_concurrent_jobs,
                    dry_run,
                    checkpoint_store,
                    copy_tool,
                    &audit,
                    &session_stop,
                    &access_path,
                    &destination,
                )
                .await
            })
            .await
    } else {
        let source = resolve_source(&profile.source)?;
        execute_profile(
            profile,
            profile_index,
            session_id,
            settings,
            max_concurrent_jobs,
            dry_run,
            checkpoint_store,
            copy_tool,
            audit,
            session_stop,
            &source,
            &destination,
        )
        .await
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute_profile(
    profile: &ProfileConfig,
    profile_index: u32,
    session_id: &str,
    settings: &Settings,
    max_concurrent_jobs: usize,
    dry_run: bool,
    checkpoint_store: &CheckpointStore,
    copy_tool: &dyn CopyTool,
    audit: &Arc<AuditLog>,
    session_stop: &Arc<AtomicBool>,
    source: &CanonicalPath,
    destination: &CanonicalPath,
) -> Result<ProfileOutcome, RobocurseError> {
    let (root, enum_errors) = tree::build_tree(source);
    for err in &enum_errors {
        tracing::warn!(path = %err.path.display(), "subtree enumeration error: {}", err.message);
    }

    let caps = ChunkCaps {
        max_size_bytes: profile.chunk_max_size_bytes,
        max_files: profile.chunk_max_files,
        max_depth: profile.chunk_max_depth,
        min_size_bytes: profile.min_size_bytes,
    };
    let all_chunks = chunk::plan_chunks(&root, source, destination, caps, profile.scan_mode)?;

    let existing_checkpoint = checkpoint_store.load(&profile.name);
    let completed_set = existing_checkpoint
        .as_ref()
        .map(|c| c.completed_set())
        .unwrap_or_else(robocurse::checkpoint::CompletedSet::empty);
    let chunks: Vec<Chunk> = all_chunks
        .into_iter()
        .filter(|c| !completed_set.contains(c.source_path.as_str()))
        .collect();

    if dry_run {
        for chunk in &chunks {
            tracing::info!(
                chunk_id = chunk.chunk_id,
                source = %chunk.source_path,
                bytes = chunk.estimated_size,
                files = chunk.estimated_files,
                "dry-run: would copy chunk"
            );
        }
        return Ok(ProfileOutcome {
            phase: Phase::Complete,
            failed_chunks: 0,
        });
    }

    let mut checkpoint = existing_checkpoint.unwrap_or_else(|| Checkpoint::new(session_id, profile_index, profile.name.as_str()));
    checkpoint.session_id = session_id.to_string();
    checkpoint.profile_index = profile_index;

    let mut state = OrchestrationState::new();
    state.stop_requested = session_stop.clone();
    state.start_run(&profile.name, profile_index, chunks);

    let copy_options = CopyOptions {
        thread_count: settings.copy_thread_count,
        include_patterns: profile.include_patterns.clone(),
        exclude_patterns: profile.exclude_patterns.clone(),
        retry_count: settings.copy_retry_count,
        retry_wait_secs: settings.copy_retry_wait_secs,
    };
    let stop_grace_period = Duration::from_secs(settings.stop_grace_period_secs);
    let checkpoint_every = Duration::from_secs(settings.checkpoint_interval_secs);

    let mut jobs: HashMap<u64, Job> = HashMap::new();
    let mut last_checkpoint_count = 0u64;
    let mut last_checkpoint_at = Instant::now();
    let log_path_for = |chunk_id: u64| audit.job_log_path(chunk_id);

    loop {
        let mut ctx = TickContext {
            jobs: &mut jobs,
            copy_tool,
            copy_options: &copy_options,
            max_concurrent_jobs,
            max_chunk_retries: settings.max_chunk_retries,
            stop_grace_period,
            checkpoint_store,
            checkpoint: &mut checkpoint,
            checkpoint_every_completions: settings.checkpoint_interval_completions,
            checkpoint_every,
            last_checkpoint_count: &mut last_checkpoint_count,
            last_checkpoint_at: &mut last_checkpoint_at,
            audit: Some(audit.as_ref()),
            log_path_for: &log_path_for,
        };
        state.tick(&mut ctx).await;

        if state.phase.is_terminal() {
            break;
        }
        tokio::time::sleep(TICK_INTERVAL).await;
    }

    let failed_chunks = state.finalize_checkpoint(checkpoint_store, &mut checkpoint, Some(audit.as_ref()));

    Ok(ProfileOutcome {
        phase: state.phase,
        failed_chunks,
    })
}

fn display_error(err: &RobocurseError) {
    eprintln!("error: {}", err);
    if let Some(suggestion) = err.suggestion() {
        eprintln!("  hint: {}", suggestion);
    }
}
