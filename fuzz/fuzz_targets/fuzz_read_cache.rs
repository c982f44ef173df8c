#![no_main]

use std::path::PathBuf;

use libfuzzer_sys::fuzz_target;
use fundamentalnode::config::Network;
use fundamentalnode::storage::PersistentStore;

fuzz_target!(|data: &[u8]| {
    // Cache files are untrusted once on disk: every check must fail closed.
    let store = PersistentStore::new(PathBuf::from("fuzz.dat"), Network::Main.params().magic);
    let _ = store.decode(data);
});
