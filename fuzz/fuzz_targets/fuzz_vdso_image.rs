#![no_main]

use libfuzzer_sys::fuzz_target;
use stasis_kernfeat::probes::vdso::parse_vdso_image;

const NAMES: &[&str] = &["__vdso_clock_gettime", "__vdso_time", "__kernel_rt_sigreturn"];

fuzz_target!(|data: &[u8]| {
    if let Some(table) = parse_vdso_image(data, NAMES) {
        assert_eq!(table.len, data.len() as u64);
        for sym in &table.symbols {
            assert!(NAMES.contains(&sym.name.as_str()));
        }
    }
});
