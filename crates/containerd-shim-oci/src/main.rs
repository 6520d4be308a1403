use containerd_supervisor::sandbox::shim::shim_main;

fn main() {
    shim_main();
}
