//! Event Bus - 이벤트 브로드캐스트 시스템
//!
//! 비동기 이벤트 발행/구독. 구독 방식은 두 가지:
//! - `receiver()`: broadcast 채널 (스트림 소비자, UI)
//! - `subscribe()`: 등록된 `EventListener`에 직접 전달

use super::types::{ApexEvent, EventCategory, EventSeverity};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};

// ============================================================================
// EventListener Trait
// ============================================================================

/// 이벤트 리스너 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// 이벤트 리스너 trait
#[async_trait]
pub trait EventListener: Send + Sync {
    /// 리스너 이름 (디버깅용)
    fn name(&self) -> &str;

    /// 관심 있는 이벤트 카테고리 (None이면 모든 이벤트)
    fn categories(&self) -> Option<Vec<EventCategory>> {
        None
    }

    async fn on_event(&self, event: &ApexEvent);
}

// ============================================================================
// EventFilter
// ============================================================================

/// 이벤트 필터
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub categories: Option<Vec<EventCategory>>,

    /// 이벤트 타입 패턴 (prefix 매칭, 예: "container:")
    pub event_types: Option<Vec<String>>,

    pub task_ids: Option<Vec<String>>,

    pub min_severity: Option<EventSeverity>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_categories(mut self, categories: Vec<EventCategory>) -> Self {
        self.categories = Some(categories);
        self
    }

    pub fn with_event_types(mut self, types: Vec<String>) -> Self {
        self.event_types = Some(types);
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_ids.get_or_insert_with(Vec::new).push(task_id.into());
        self
    }

    pub fn with_min_severity(mut self, severity: EventSeverity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    /// 이벤트가 필터를 통과하는지 확인
    pub fn matches(&self, event: &ApexEvent) -> bool {
        if let Some(ref cats) = self.categories {
            if !cats.contains(&event.category) {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| event.event_type.starts_with(t)) {
                return false;
            }
        }

        if let Some(ref ids) = self.task_ids {
            match &event.task_id {
                Some(id) if ids.contains(id) => {}
                _ => return false,
            }
        }

        if let Some(min_sev) = self.min_severity {
            if event.severity < min_sev {
                return false;
            }
        }

        true
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// 이벤트 버스 설정
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// 브로드캐스트 채널 용량
    pub channel_capacity: usize,

    /// 이벤트 히스토리 보관 개수
    pub history_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            history_size: 256,
        }
    }
}

struct RegisteredListener {
    listener: Arc<dyn EventListener>,
    filter: Option<EventFilter>,
}

/// 이벤트 버스
pub struct EventBus {
    config: EventBusConfig,
    sender: broadcast::Sender<ApexEvent>,
    listeners: RwLock<HashMap<ListenerId, RegisteredListener>>,
    listener_counter: AtomicU64,
    history: RwLock<VecDeque<ApexEvent>>,
    event_count: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));

        Self {
            config,
            sender,
            listeners: RwLock::new(HashMap::new()),
            listener_counter: AtomicU64::new(0),
            history: RwLock::new(VecDeque::new()),
            event_count: AtomicU64::new(0),
        }
    }

    /// 리스너 등록
    pub async fn subscribe(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.subscribe_with_filter(listener, None).await
    }

    /// 필터와 함께 리스너 등록
    pub async fn subscribe_with_filter(
        &self,
        listener: Arc<dyn EventListener>,
        filter: Option<EventFilter>,
    ) -> ListenerId {
        let id = ListenerId(self.listener_counter.fetch_add(1, Ordering::SeqCst));

        debug!(
            listener_name = listener.name(),
            listener_id = %id,
            "Registering event listener"
        );

        self.listeners
            .write()
            .await
            .insert(id, RegisteredListener { listener, filter });

        id
    }

    /// 리스너 해제
    pub async fn unsubscribe(&self, id: ListenerId) -> bool {
        let removed = self.listeners.write().await.remove(&id).is_some();
        if removed {
            debug!(listener_id = %id, "Unregistered event listener");
        }
        removed
    }

    /// 이벤트 발행
    pub async fn publish(&self, event: ApexEvent) {
        self.event_count.fetch_add(1, Ordering::SeqCst);

        trace!(
            event_id = %event.id,
            event_type = %event.event_type,
            task_id = ?event.task_id,
            "Publishing event"
        );

        {
            let mut history = self.history.write().await;
            history.push_back(event.clone());
            while history.len() > self.config.history_size {
                history.pop_front();
            }
        }

        // 수신자가 없으면 send는 실패하지만 정상 상황
        let _ = self.sender.send(event.clone());

        let listeners = self.listeners.read().await;
        for registered in listeners.values() {
            let should_deliver = match &registered.filter {
                Some(filter) => filter.matches(&event),
                None => match registered.listener.categories() {
                    Some(cats) => cats.contains(&event.category),
                    None => true,
                },
            };

            if should_deliver {
                registered.listener.on_event(&event).await;
            }
        }
    }

    /// 브로드캐스트 수신자 생성 (스트림 방식)
    pub fn receiver(&self) -> broadcast::Receiver<ApexEvent> {
        self.sender.subscribe()
    }

    /// 최근 이벤트 (최신순)
    pub async fn history(&self, limit: Option<usize>) -> Vec<ApexEvent> {
        let history = self.history.read().await;
        let limit = limit.unwrap_or(history.len());
        history.iter().rev().take(limit).cloned().collect()
    }

    /// 필터로 히스토리 검색 (발행순)
    pub async fn search_history(&self, filter: &EventFilter) -> Vec<ApexEvent> {
        self.history
            .read()
            .await
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// 총 발행된 이벤트 수
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
