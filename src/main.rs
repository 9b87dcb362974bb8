use std::env::args;
use std::str::FromStr;
use std::string::ToString;

use strum::IntoEnumIterator;
use strum_macros::{self, Display, EnumIter, EnumString};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    args()
        .nth(1)
        .ok_or(format!(
            "no demo supplied, use one of {} or see unit tests",
            Demo::iter()
                .map(|d| d.to_string())
                .collect::<Vec<String>>()
                .join(",")
        ))
        .and_then(|selector| {
            Demo::from_str(&selector)
                .map(|demo| match demo {
                    Demo::Mutex => bounded_sync::mutex::run(),
                    Demo::Condvar => bounded_sync::condvar::run(),
                    Demo::BoundedQueue => bounded_sync::bounded::run(),
                    Demo::ReadWrite => bounded_sync::rwlock::run(),
                    Demo::Optimistic => bounded_sync::optimistic::run(),
                    Demo::Rendezvous => bounded_sync::rendezvous::run(),
                    Demo::Priority => bounded_sync::priority::run(),
                    Demo::Delay => bounded_sync::delay::run(),
                })
                .map_err(|e| e.to_string())
        })
}

#[derive(EnumIter, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
enum Demo {
    Mutex,
    Condvar,
    BoundedQueue,
    ReadWrite,
    Optimistic,
    Rendezvous,
    Priority,
    Delay,
}
