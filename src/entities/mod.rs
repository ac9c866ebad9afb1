pub mod cart;
pub mod coupon;
pub mod order;
pub mod order_line;
pub mod payment_setting;
pub mod payment_transaction;

pub use order::{OrderStatus, PaymentMethod, PaymentStatus};
pub use payment_transaction::TransactionStatus;
