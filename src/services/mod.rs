pub mod cart;
pub mod catalog;
pub mod checkout;
pub mod notifications;
pub mod orders;
pub mod payments;
pub mod users;

pub use cart::{CartService, CartStore, CartWithItems};
pub use catalog::{CatalogReader, CatalogService, Page, ProductQuery};
pub use checkout::{CheckoutRequest, CheckoutResponse, CheckoutService};
pub use notifications::{NotificationDispatcher, Notifier};
pub use orders::{OrderService, OrderStore, OrderWithItems};
pub use payments::{PaymentCoordinator, PaymentGateway, PaymentLedger, SeaOrmPaymentLedger};
pub use users::{UserDirectory, UserService};
