//! Rate limiting logic and state management.

mod backend;
mod counter;
mod headers;
mod key;
mod limiter;
mod window;

pub use backend::WindowCounterStore;
pub use counter::LocalWindowCounter;
pub use headers::ResponseHeaders;
pub use key::{
    canonicalize_ip, first_forwarded_for, parse_trusted_proxy, KeyDeriver, KEY_SEPARATOR,
    TRUE_CLIENT_IP, X_FORWARDED_FOR, X_REAL_IP,
};
pub use limiter::{
    estimate_count, Decision, ErrorHandler, RateLimited, RateLimitedHandler, RateLimiter,
    RateLimiterBuilder,
};
pub use window::Window;
