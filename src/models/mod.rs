pub mod cart_item;
pub mod money;
pub mod order;
pub mod stock;

pub use cart_item::{
    add_line, cart_subtotal, composite_id, remove_line, set_line_quantity, CartItem,
    MAX_LINE_QUANTITY, MAX_UNIT_PRICE,
};
pub use money::{from_minor, parse_price, to_minor};
pub use order::{OrderLineView, OrderTotals, OrderView, ShippingInfo};
pub use stock::{
    available_quantity, variant_key, ProductTypeStock, StockEntry, StockLevel, StockSnapshot,
};
