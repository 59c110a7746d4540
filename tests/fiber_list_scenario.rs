//! A fiber suspended mid-sleep must show up in `fiber::list()` with its
//! name and, once it has actually swapped out at least once, a resumable
//! program counter and stack pointer.

use pth::fiber::{self, Builder};
use std::time::Duration;

#[test]
fn a_sleeping_fiber_is_visible_in_the_listing() {
    Builder::new()
        .name("sleeper")
        .start(|| {
            fiber::sleep(Duration::from_millis(200));
        })
        .expect("failed to spawn fiber");

    // `start` already ran the fiber inline up to its sleep, suspending it
    // (and saving its machine context) before returning here. A lone
    // sleeper is the only fiber registered, so the very next tick would
    // fire its timer and let it run to completion — the listing has to be
    // taken now, not after a tick.
    let snapshot = fiber::list();
    let entry = snapshot
        .iter()
        .find(|info| info.name == "sleeper")
        .expect("sleeping fiber missing from listing");
    assert!(entry.stack_size > 0);

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        assert!(entry.stack_pointer.is_some());
        assert!(entry.program_counter.is_some());
    }

    while fiber::count() > 0 {
        fiber::tick();
    }
    assert!(fiber::list().is_empty());
}
