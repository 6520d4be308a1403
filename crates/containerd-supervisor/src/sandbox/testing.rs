//! Test helpers: a fake OCI runtime, fake shims and bundles.
//!
//! The fakes are shell scripts written once per test binary. They keep all their state in
//! files so tests can inspect what was asked of them.

use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use oci_spec::runtime::Spec;
use tempfile::TempDir;

use crate::sandbox::config::Config;
use crate::sandbox::runtime::OciRuntime;
use crate::sys::reaper::{self, Monitor};

/// The reaper of the test process, started on first use.
pub fn monitor() -> Monitor {
    static MONITOR: OnceLock<Monitor> = OnceLock::new();
    MONITOR
        .get_or_init(|| {
            reaper::monitor()
                .map(Ok)
                .unwrap_or_else(reaper::init)
                .expect("failed to start the reaper")
        })
        .clone()
}

const FAKE_RUNTIME: &str = r#"#!/bin/sh
root=/tmp/fake-runtime
log=
globals=
while [ $# -gt 0 ]; do
    case "$1" in
        --root) root="$2"; shift 2 ;;
        --log) log="$2"; globals="$globals --log"; shift 2 ;;
        --log-format) shift 2 ;;
        --*) globals="$globals $1"; shift ;;
        *) break ;;
    esac
done
cmd="$1"
[ $# -gt 0 ] && shift
mkdir -p "$root"
echo "$cmd $* |$globals" >> "$root/calls.log"

fail() {
    if [ -n "$log" ]; then
        printf '{"level":"error","msg":"%s"}\n' "$1" >> "$log"
    fi
    echo "$1" >&2
    exit 1
}

pidfile=
bundle=
image=
flags=
while [ $# -gt 1 ]; do
    case "$1" in
        --pid-file) pidfile="$2"; shift 2 ;;
        --bundle|-b) bundle="$2"; shift 2 ;;
        --image-path) image="$2"; shift 2 ;;
        --process|--work-path|--format|--empty-ns|--console-socket) shift 2 ;;
        *) flags="$flags $1"; shift ;;
    esac
done
id="$1"
dir="$root/$id"

has_flag() {
    case "$flags " in
        *" $1 "*) return 0 ;;
    esac
    return 1
}

launch() {
    if [ -n "$bundle" ] && [ -f "$bundle/workload" ]; then
        set -- "$1" sh "$bundle/workload"
    else
        set -- "$1" sleep 1000
    fi
    if [ "$1" = gated ]; then
        shift
        ( while [ ! -e "$dir/started" ]; do sleep 0.02; done; exec "$@" ) &
    else
        shift
        ( exec "$@" ) &
    fi
    child=$!
    if [ -n "$pidfile" ]; then
        printf '%d' "$child" > "$pidfile.tmp" && mv "$pidfile.tmp" "$pidfile"
    fi
}

write_status() {
    printf '%s' "$1" > "$dir/status"
}

case "$cmd" in
    create)
        [ -e "$dir" ] && fail "container $id already exists"
        mkdir -p "$dir"
        printf '%s' "$bundle" > "$dir/bundle"
        launch gated
        printf '%d' "$child" > "$dir/pid"
        write_status created
        ;;
    start)
        mkdir -p "$dir"
        touch "$dir/started"
        write_status running
        ;;
    state)
        [ -f "$dir/pid" ] || fail "container $id does not exist"
        pid=$(cat "$dir/pid")
        status=$(cat "$dir/status")
        kill -0 "$pid" 2>/dev/null || status=stopped
        printf '{"ociVersion":"1.0.2","id":"%s","pid":%d,"status":"%s","bundle":"%s","created":"2024-01-01T00:00:00Z","annotations":{}}\n' \
            "$id" "$pid" "$status" "$(cat "$dir/bundle")"
        ;;
    delete)
        [ -d "$dir" ] || fail "container $id does not exist"
        rm -rf "$dir"
        ;;
    exec)
        [ -d "$dir" ] || fail "container $id does not exist"
        bundle=
        launch now
        ;;
    checkpoint)
        [ -f "$dir/pid" ] || fail "container $id does not exist"
        mkdir -p "$image"
        cp "$dir/pid" "$image/pid"
        echo "$flags" > "$image/flags"
        if ! has_flag --leave-running; then
            kill -9 "$(cat "$dir/pid")" 2>/dev/null
            write_status stopped
        fi
        ;;
    restore)
        [ -e "$dir/pid" ] && fail "container $id already exists"
        [ -f "$image/pid" ] || fail "no checkpoint image in $image"
        mkdir -p "$dir"
        printf '%s' "$bundle" > "$dir/bundle"
        launch now
        printf '%d' "$child" > "$dir/pid"
        write_status running
        ;;
    pause)
        [ -d "$dir" ] || fail "container $id does not exist"
        write_status paused
        ;;
    resume)
        [ -d "$dir" ] || fail "container $id does not exist"
        write_status running
        ;;
    ps)
        [ -f "$dir/pid" ] || fail "container $id does not exist"
        printf '[%d]\n' "$(cat "$dir/pid")"
        ;;
    events)
        [ -d "$dir" ] || fail "container $id does not exist"
        printf '{"type":"stats","id":"%s","data":{"pids":{"current":1}}}\n' "$id"
        ;;
    *)
        fail "unknown command $cmd"
        ;;
esac
"#;

/// Runs the bundle's workload (or sleeps) and persists its exit status like a real shim.
const SHIM_NORMAL: &str = r#"#!/bin/sh
exec 3>exit
if [ -f "$2/workload" ]; then
    sh "$2/workload" </dev/null >/dev/null 2>&1 &
else
    sleep 1000 </dev/null >/dev/null 2>&1 &
fi
child=$!
printf '%d' "$child" > pid.tmp && mv pid.tmp pid
wait "$child"
status=$?
printf '%d' "$status" > exitStatus.tmp && mv exitStatus.tmp exitStatus
"#;

/// Takes its time recording the exit status, like a shim on a loaded host.
const SHIM_SLOW_EXIT: &str = r#"#!/bin/sh
exec 3>exit
sleep 1000 </dev/null >/dev/null 2>&1 &
child=$!
printf '%d' "$child" > pid.tmp && mv pid.tmp pid
wait "$child"
status=$?
sleep 1.5
printf '%d' "$status" > exitStatus.tmp && mv exitStatus.tmp exitStatus
"#;

const SHIM_DIES_BEFORE_PID: &str = r#"#!/bin/sh
exec 3>exit
echo '{"level":"error","msg":"failed to create container: boom"}' >&2
kill -9 $$
"#;

const SHIM_DIES_AFTER_PID: &str = r#"#!/bin/sh
exec 3>exit
sleep 1000 </dev/null >/dev/null 2>&1 &
printf '%d' "$!" > pid.tmp && mv pid.tmp pid
sleep 0.5
kill -9 $$
"#;

const SHIM_NEVER_REPORTS: &str = r#"#!/bin/sh
exec 3>exit
sleep 1000
"#;

/// Flavours of fake shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeShim {
    /// Behaves like a real shim around `sleep 1000` or the bundle's `workload`.
    Normal,
    /// Records the exit status well after the process exited.
    SlowExit,
    /// Logs an error and is killed before reporting a pid.
    DiesBeforePid,
    /// Reports a pid, then is killed leaving the process orphaned.
    DiesAfterPid,
    /// Never reports a pid.
    NeverReports,
}

struct Scripts {
    _dir: TempDir,
    runtime: PathBuf,
    normal: PathBuf,
    slow_exit: PathBuf,
    dies_before_pid: PathBuf,
    dies_after_pid: PathBuf,
    never_reports: PathBuf,
}

fn scripts() -> &'static Scripts {
    static SCRIPTS: OnceLock<Scripts> = OnceLock::new();
    SCRIPTS.get_or_init(|| {
        let dir = tempfile::Builder::new()
            .prefix("supervisor-fakes")
            .tempdir()
            .expect("failed to create a directory for the fakes");
        let write = |name: &str, contents: &str| {
            let path = dir.path().join(name);
            fs::write(&path, contents).expect("failed to write fake script");
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .expect("failed to make fake script executable");
            path
        };
        Scripts {
            runtime: write("fake-runtime", FAKE_RUNTIME),
            normal: write("fake-shim", SHIM_NORMAL),
            slow_exit: write("fake-shim-slow-exit", SHIM_SLOW_EXIT),
            dies_before_pid: write("fake-shim-dies-before-pid", SHIM_DIES_BEFORE_PID),
            dies_after_pid: write("fake-shim-dies-after-pid", SHIM_DIES_AFTER_PID),
            never_reports: write("fake-shim-never-reports", SHIM_NEVER_REPORTS),
            _dir: dir,
        }
    })
}

pub fn fake_runtime() -> PathBuf {
    scripts().runtime.clone()
}

pub fn fake_shim(kind: FakeShim) -> PathBuf {
    let scripts = scripts();
    match kind {
        FakeShim::Normal => scripts.normal.clone(),
        FakeShim::SlowExit => scripts.slow_exit.clone(),
        FakeShim::DiesBeforePid => scripts.dies_before_pid.clone(),
        FakeShim::DiesAfterPid => scripts.dies_after_pid.clone(),
        FakeShim::NeverReports => scripts.never_reports.clone(),
    }
}

/// The fake runtime keeping its state under `root`.
pub fn runtime(root: &Path) -> OciRuntime {
    OciRuntime::new(
        fake_runtime().to_string_lossy(),
        Some(root.to_path_buf()),
        vec![],
        monitor(),
    )
}

/// Every invocation of the fake runtime under `root`, as `<subcommand> <args> | <globals>`.
pub fn runtime_calls(root: &Path) -> std::io::Result<Vec<String>> {
    let calls = fs::read_to_string(root.join("calls.log"))?;
    Ok(calls.lines().map(str::to_string).collect())
}

/// Creates a bundle with a default runtime spec. `workload` is a shell script the fakes run
/// in place of `sleep 1000`.
pub fn create_bundle(dir: &Path, workload: Option<&str>) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir.join("rootfs"))?;
    Spec::default().save(dir.join("config.json"))?;
    if let Some(workload) = workload {
        fs::write(dir.join("workload"), workload)?;
    }
    Ok(dir.to_path_buf())
}

/// A supervisor configuration rooted in `dir` that uses the fake runtime and `shim`.
pub fn config(dir: &Path, shim: impl Into<PathBuf>) -> Config {
    Config {
        root: dir.join("state"),
        runtime_binary: Some(fake_runtime().to_string_lossy().into_owned()),
        runtime_root: dir.join("runtime"),
        shim: shim.into(),
        start_timeout_secs: 10,
        ..Default::default()
    }
}
