//! Process-wide monotonic ULID source.

use std::sync::{LazyLock, Mutex, PoisonError};

use ulid::{Generator, Ulid};

static GENERATOR: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

/// Returns a ULID strictly greater than every ULID previously returned in
/// this process, including ones minted within the same millisecond.
#[doc(hidden)]
pub fn next_ulid() -> Ulid {
    let mut generator = GENERATOR.lock().unwrap_or_else(PoisonError::into_inner);
    match generator.generate() {
        Ok(ulid) => ulid,
        // 2^80 ids within one millisecond: wait for the clock to move on.
        Err(_) => loop {
            std::thread::yield_now();
            if let Ok(ulid) = generator.generate() {
                break ulid;
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strictly_increasing_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    let ids: Vec<Ulid> = (0..2000).map(|_| next_ulid()).collect();
                    assert!(ids.windows(2).all(|w| w[0] < w[1]));
                    ids
                })
            })
            .collect();

        let mut all: Vec<Ulid> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
