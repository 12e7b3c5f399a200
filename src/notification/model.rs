//! 通知数据模型
//!
//! 推送通道和轮询对账共用的规范化通知记录。服务端字段命名不统一
//! （`createdAt` / `created_at`，`data` / `payload`），反序列化时统一接受。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 通知 ID（服务端分配，单调递增，唯一的排序和去重键）
pub type NotificationId = u64;

/// 通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationType {
    /// 新订单
    NewOrder,
    /// 订单状态变化
    OrderStatusUpdate,
    /// 其他
    Generic,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::NewOrder => "new_order",
            NotificationType::OrderStatusUpdate => "order_status_update",
            NotificationType::Generic => "generic",
        }
    }

    /// 宽松解析，大小写和下划线不敏感，未知类型归为 Generic
    pub fn parse(raw: &str) -> Self {
        match normalize_type_name(raw).as_str() {
            "neworder" => NotificationType::NewOrder,
            "orderstatusupdate" | "orderstatus" | "statusupdate" => {
                NotificationType::OrderStatusUpdate
            }
            _ => NotificationType::Generic,
        }
    }
}

/// `new_order`、`NewOrder`、`NEW_ORDER` 统一为 `neworder`
fn normalize_type_name(raw: &str) -> String {
    raw.trim().to_lowercase().replace(['_', '-', '.'], "")
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for NotificationType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NotificationType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(NotificationType::parse(&raw))
    }
}

/// 订单摘要（通知创建时的快照）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummary {
    #[serde(
        default,
        alias = "order_id",
        alias = "id",
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub order_id: Option<String>,
    #[serde(default, alias = "customer_name", alias = "customer", skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, alias = "product_name", alias = "product", skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    #[serde(default, alias = "delivery_address", alias = "deliveryAddress", skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, alias = "total_amount", alias = "totalAmount", skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// 非对象 payload（字符串、数组）不应让整条通知解析失败
fn lenient_payload<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<OrderSummary>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .filter(|v| v.is_object())
        .and_then(|v| serde_json::from_value(v).ok()))
}

/// 规范化通知记录
///
/// 创建后不可变；`read` 由 store 的读状态机覆盖，批次中的值只对新 id 生效。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    #[serde(rename = "type", default = "default_type")]
    pub kind: NotificationType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(
        default,
        alias = "data",
        deserialize_with = "lenient_payload",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload: Option<OrderSummary>,
    #[serde(default, alias = "isRead", alias = "is_read")]
    pub read: bool,
    #[serde(default = "Utc::now", alias = "createdAt")]
    pub created_at: DateTime<Utc>,
}

fn default_type() -> NotificationType {
    NotificationType::Generic
}

impl Notification {
    pub fn new(id: NotificationId, kind: NotificationType) -> Self {
        Self {
            id,
            kind,
            title: String::new(),
            message: String::new(),
            payload: None,
            read: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_payload(mut self, payload: OrderSummary) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }
}

/// 推送连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// 推送断开，轮询仍在维持 store
    Degraded,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
