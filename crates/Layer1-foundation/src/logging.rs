//! Logging - tracing 구독자 초기화

use crate::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// 전역 tracing 구독자 설치
///
/// `RUST_LOG`가 있으면 그 값을, 없으면 `default_level`을 사용한다.
/// 이미 설치된 경우 아무것도 하지 않는다 (테스트에서 반복 호출 가능).
pub fn init_tracing(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| Error::Config(format!("Invalid log filter '{}': {}", default_level, e)))?;

    // 두 번째 호출은 "already set" 에러 → 무시
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init_tracing("debug").is_ok());
        assert!(init_tracing("info").is_ok());
    }
}
