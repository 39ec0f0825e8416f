/// Above this many workers the renderer toolchain tends to thrash.
pub const SOFT_WORKER_CAP: usize = 16;

pub fn logical_cpus() -> usize {
    num_cpus::get().max(1)
}

/// Default pool size: half the logical cores (each worker also runs a
/// renderer child), capped, and never more than there are files.
pub fn default_workers(cpus: usize, files: usize) -> usize {
    (cpus / 2).clamp(1, SOFT_WORKER_CAP).min(files.max(1))
}

/// Reasons a requested worker count looks too high. Advisory only.
pub fn worker_warnings(workers: usize, cpus: usize) -> Vec<String> {
    let mut out = Vec::new();
    if workers > cpus {
        out.push(format!(
            "{workers} workers exceed the {cpus} logical CPUs; renders will compete for cores"
        ));
    }
    if workers > SOFT_WORKER_CAP {
        out.push(format!(
            "{workers} workers is above {SOFT_WORKER_CAP}; expect memory pressure"
        ));
    }
    out
}
