#![no_main]

use browserchannel::channel::ArraySequencer;
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|ids: Vec<u8>| {
    deliver(ids);
});

/// Released ids are strictly increasing and contiguous whatever the arrival order
fn deliver(ids: Vec<u8>) {
    let mut sequencer = ArraySequencer::new(64);
    let mut expected = 0i64;
    for id in ids {
        let released = match sequencer.accept(id as i64, Value::from(id)) {
            Ok(released) => released,
            Err(e) => {
                assert!(e.id > e.expected);
                return;
            }
        };
        for (id, payload) in released {
            assert_eq!(id, expected);
            assert_eq!(payload, Value::from(id as u8));
            expected += 1;
        }
        assert_eq!(sequencer.last_array_id(), expected - 1);
    }
}
