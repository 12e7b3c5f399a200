//! 播报文本模板
//!
//! 字段顺序固定：客户、商品与数量、地址、金额。缺失字段使用固定兜底文本，
//! 保证同一通知总是生成同一句话。

use crate::notification::model::{Notification, OrderSummary};

pub const FALLBACK_CUSTOMER: &str = "Client";
pub const FALLBACK_PRODUCT: &str = "Produit";
pub const FALLBACK_ADDRESS: &str = "Adresse non renseignée";
pub const FALLBACK_TOTAL: &str = "Montant inconnu";
pub const DEFAULT_CURRENCY: &str = "euros";

/// 新订单播报文本
pub fn order_announcement(notification: &Notification, currency: &str) -> String {
    let empty = OrderSummary::default();
    let order = notification.payload.as_ref().unwrap_or(&empty);

    let customer = non_blank(order.customer_name.as_deref()).unwrap_or(FALLBACK_CUSTOMER);
    let product = non_blank(order.product_name.as_deref()).unwrap_or(FALLBACK_PRODUCT);
    let quantity = order.quantity.unwrap_or(1);
    let address = non_blank(order.address.as_deref()).unwrap_or(FALLBACK_ADDRESS);
    let total = order
        .total
        .map(|t| format!("{} {}", format_amount(t), currency))
        .unwrap_or_else(|| FALLBACK_TOTAL.to_string());

    format!(
        "Nouvelle commande. Client : {}. Produit : {}, quantité {}. Adresse : {}. Total : {}.",
        customer, product, quantity, address, total
    )
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// 整数不带小数，否则两位小数，小数点用逗号
fn format_amount(amount: f64) -> String {
    if amount.fract() == 0.0 {
        format!("{:.0}", amount)
    } else {
        format!("{:.2}", amount).replace('.', ",")
    }
}
