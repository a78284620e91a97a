//! Round-robin selection of the next context to run.
//!
//! Only selects, the transfer itself is up to [super::switcher].

use super::registry::{Registry, Slot, State};

/// Picks the first ready record after [current] in list order.
///
/// Falls back to the driver once the scan wraps around to [current] without finding one.
/// The driver itself starts its scan at the head of the list.
pub(super) fn schedule_next(registry: &Registry, current: Slot) -> Slot {
    let current = match current {
        Slot::Driver => {
            return registry
                .iter()
                .find(|(_, record)| record.state == State::Ready)
                .map_or(Slot::Driver, |(index, _)| Slot::Thread(index));
        }
        Slot::Thread(index) => index,
    };

    let mut candidate = registry.next_of(current);
    while candidate != current {
        if registry.get(candidate).state == State::Ready {
            return Slot::Thread(candidate);
        }
        candidate = registry.next_of(candidate);
    }

    Slot::Driver
}
