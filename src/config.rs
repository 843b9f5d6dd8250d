use std::env;
use std::time::Duration;

pub fn get_env_as_int(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

pub fn get_env_as_duration(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| parse_duration(&v))
        .unwrap_or(default)
}

/// Parse Go-style duration strings like "5s", "100ms", "2m", "1h"
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let num_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    if num_end == 0 {
        return None;
    }
    let num: f64 = s[..num_end].parse().ok()?;
    match &s[num_end..] {
        "ms" => Some(Duration::from_millis(num as u64)),
        "s" | "" => Some(Duration::from_secs_f64(num)),
        "m" => Some(Duration::from_secs_f64(num * 60.0)),
        "h" => Some(Duration::from_secs_f64(num * 3600.0)),
        _ => None,
    }
}

lazy_static_config! {
    pub TCP_DATA_BUF_SIZE: usize = get_env_as_int("BURROW_TCP_DATA_BUF_SIZE", 16384);
    pub FIRST_READ_BUF_SIZE: usize = get_env_as_int("BURROW_FIRST_READ_BUF_SIZE", 10240);
    pub HANDSHAKE_TIMEOUT: Duration = get_env_as_duration("BURROW_HANDSHAKE_TIMEOUT", Duration::from_secs(5));
    pub RETRY_INTERVAL: Duration = get_env_as_duration("BURROW_RETRY_INTERVAL", Duration::from_secs(5));
    pub REPORT_INTERVAL: Duration = get_env_as_duration("BURROW_REPORT_INTERVAL", Duration::from_secs(5));
}

pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

#[macro_export]
macro_rules! lazy_static_config {
    ($($vis:vis $name:ident : $ty:ty = $init:expr;)*) => {
        $(
            #[allow(non_snake_case, dead_code)]
            $vis fn $name() -> $ty {
                use std::sync::OnceLock;
                static VALUE: OnceLock<$ty> = OnceLock::new();
                *VALUE.get_or_init(|| $init)
            }
        )*
    };
}
pub(crate) use lazy_static_config;
