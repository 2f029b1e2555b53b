//! Kernel module detection (spec.md §4.4 "Preconditions", §6).

use std::io::BufRead;

const MODULES_PATH: &str = "/proc/modules";
const CONNTRACK_MODULE: &str = "nf_conntrack";

/// Returns true if `nf_conntrack` appears as a loaded kernel module.
///
/// A line's first whitespace-delimited field must equal `nf_conntrack`
/// exactly (spec.md §6 "Kernel module detection").
pub fn conntrack_module_present() -> bool {
    conntrack_module_present_in(MODULES_PATH)
}

fn conntrack_module_present_in(path: &str) -> bool {
    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    let reader = std::io::BufReader::new(file);
    for line in reader.lines() {
        let Ok(line) = line else { continue };
        if line.split_whitespace().next() == Some(CONNTRACK_MODULE) {
            return true;
        }
    }
    false
}
