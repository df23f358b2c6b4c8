// Auto concurrency chooser extracted for testing.
// Starts from twice the available cores (copies mostly wait on disk) and backs
// off when the average file is large enough that parallel streams just thrash.

const MIB: u64 = 1024 * 1024;

pub fn hardware_threads() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

pub fn choose_auto_concurrency(total_files: usize, total_size_bytes: u64) -> usize {
    choose_auto_concurrency_for(total_files, total_size_bytes, hardware_threads())
}

/// Same heuristic with an explicit core count.
pub fn choose_auto_concurrency_for(
    total_files: usize,
    total_size_bytes: u64,
    cores: usize,
) -> usize {
    if total_files <= 1 {
        return 1;
    }

    let mut base = cores.max(1) * 2;

    let avg_size = total_size_bytes / (total_files as u64);
    if avg_size > 512 * MIB {
        base = (base / 4).max(1);
    } else if avg_size > 64 * MIB {
        base = (base / 2).max(1);
    }

    base.clamp(1, std::cmp::min(total_files, crate::transfer::MAX_WORKERS))
}
