//! Process-group signalling and resident memory sampling.

/// Send `signal` to every process in the group led by `pgid`.
#[cfg(unix)]
pub(crate) fn signal_group(pgid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a stale pgid
    // yields ESRCH, which is ignored.
    unsafe {
        libc::kill(-pgid, signal);
    }
}

/// Total resident set size, in bytes, of all processes in group `pgid`.
///
/// Returns `None` when `/proc` is unavailable.
#[cfg(target_os = "linux")]
pub(crate) fn group_rss_bytes(pgid: u32) -> Option<u64> {
    // SAFETY: sysconf is a pure query.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = u64::try_from(page_size).ok().filter(|p| *p > 0)?;

    let entries = std::fs::read_dir("/proc").ok()?;
    let mut pages = 0u64;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        // Processes can vanish between readdir and read.
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some((group, rss)) = parse_stat(&stat) {
            if group == pgid {
                pages = pages.saturating_add(rss);
            }
        }
    }
    Some(pages.saturating_mul(page_size))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn group_rss_bytes(_pgid: u32) -> Option<u64> {
    None
}

/// Extract `(pgrp, rss_pages)` from a `/proc/<pid>/stat` line.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat(stat: &str) -> Option<(u32, u64)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is `state` (field 3 in proc(5)); pgrp is field 5, rss field 24.
    let pgrp = fields.get(2)?.parse().ok()?;
    let rss = fields.get(21)?.parse().ok()?;
    Some((pgrp, rss))
}
