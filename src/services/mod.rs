// Cart
pub mod cart_sync;
pub mod carts;

// Catalog lookups
pub mod coupons;
pub mod stock;

// Checkout and orders
pub mod order_cleanup;
pub mod orders;

// Payments
pub mod gateway;
pub mod payment_methods;
pub mod payments;
