use std::fs::File;
use std::io::{BufRead as _, BufReader};
use std::path::{Path, PathBuf};

use super::cli::Args;
use super::io::StdioFiles;
use crate::sandbox::checkpoint::Checkpoint;
use crate::sandbox::process_state::{PROCESS_STATE_FILE, ProcessState};
use crate::sandbox::runtime::{Io, LaunchOpts, OciRuntime};
use crate::sandbox::{Error, Result};
use crate::sys::fifo::{ControlMessage, open_control_reader, open_exit_writer};
use crate::sys::reaper;
use crate::sys::shim::{PID_FILE, RUNTIME_LOG_FILE, write_exit_status};

/// Launches the process described by `process.json` in the working directory and
/// waits for it to exit, recording its exit status in `exitStatus`.
///
/// The runtime is only used to launch the process. Deleting the container is left
/// to the supervisor.
pub async fn run(args: Args) -> Result<()> {
    let monitor = reaper::init()?;
    let cwd = std::env::current_dir()?;

    // held until we exit, the supervisor watches for it to close
    let exit = open_exit_writer(&cwd)?;
    let control = open_control_reader(&cwd)?;

    let state = ProcessState::load(&cwd)?;
    if state.process.terminal() == Some(true) {
        return Err(Error::InvalidArgument(
            "terminal is not supported".to_string(),
        ));
    }
    let StdioFiles {
        io,
        stdin_keepalive,
    } = StdioFiles::open(&state.stdio())?;

    let runtime = OciRuntime::new(
        args.runtime.as_str(),
        None,
        state.runtime_args.clone(),
        monitor.clone(),
    );
    let opts = LaunchOpts {
        pid_file: cwd.join(PID_FILE),
        log: Some(cwd.join(RUNTIME_LOG_FILE)),
        no_pivot_root: state.no_pivot_root,
    };

    // the process is reparented to us once the runtime exits, so subscribe before launching it
    let mut subscription = monitor.subscribe();
    let pid = launch(&runtime, &args, &cwd, &state, &opts, &io).await?;
    drop(io);
    log::info!("container {} process has pid {pid}", args.id);

    spawn_control_loop(control, stdin_keepalive);

    let event = subscription.wait_for(pid).await.ok_or_else(|| {
        Error::Others(format!("lost track of pid {pid}"))
    })?;
    log::info!("container {} process {pid} exited: {event}", args.id);

    write_exit_status(&cwd, event.code)?;
    drop(exit);
    Ok(())
}

async fn launch(
    runtime: &OciRuntime,
    args: &Args,
    cwd: &Path,
    state: &ProcessState,
    opts: &LaunchOpts,
    io: &Io,
) -> Result<i32> {
    if state.exec {
        let spec = cwd.join(PROCESS_STATE_FILE);
        return runtime.exec(&args.id, &args.bundle, &spec, opts, io).await;
    }
    if !state.checkpoint.is_empty() {
        let image = PathBuf::from(&state.checkpoint);
        let checkpoint = Checkpoint::load(&image)?;
        log::info!("restoring {} from checkpoint {}", args.id, checkpoint.name);
        return runtime
            .restore(&args.id, &args.bundle, &image, &checkpoint, opts, io)
            .await;
    }
    runtime.create(&args.id, &args.bundle, opts, io).await
}

/// Serves the `control` fifo on a dedicated thread; reads on a fifo block.
fn spawn_control_loop(control: File, mut stdin_keepalive: Option<File>) {
    let spawned = std::thread::Builder::new()
        .name("control".to_string())
        .spawn(move || {
            for line in BufReader::new(control).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        log::warn!("reading the control fifo failed: {err}");
                        break;
                    }
                };
                match line.parse::<ControlMessage>() {
                    Ok(ControlMessage::CloseStdin) => {
                        log::debug!("closing stdin");
                        stdin_keepalive.take();
                    }
                    Ok(ControlMessage::Resize { width, height }) => {
                        log::debug!("ignoring resize to {width}x{height}, no terminal");
                    }
                    Err(err) => log::warn!("{err}"),
                }
            }
        });
    if let Err(err) = spawned {
        log::error!("failed to spawn the control thread: {err}");
    }
}
