//! Event System - 이벤트 발행/구독 시스템
//!
//! Orchestrator가 Task/워크스페이스/컨테이너 상태 변화를 발행하고
//! UI/CLI 협력자가 구독합니다.
//!
//! ## 아키텍처
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EventBus                              │
//! │  publish(event) ──┬──────────────────┬───────────────────┐  │
//! │                   ▼                  ▼                   ▼  │
//! │          broadcast::Receiver   EventListener 1   EventListener N
//! │          (UI event feed)       (filtered)        (filtered)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 사용법
//!
//! ```ignore
//! use apex_foundation::event::{EventBus, types::task};
//!
//! let bus = EventBus::new();
//! let mut feed = bus.receiver();
//!
//! bus.publish(task::created(&record)).await;
//! let event = feed.recv().await?;
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusConfig, EventFilter, EventListener, ListenerId};

pub use types::{
    // Event constructors
    container,
    system,
    task,
    workspace,
    // Core types
    ApexEvent,
    EventCategory,
    EventId,
    EventSeverity,
};
