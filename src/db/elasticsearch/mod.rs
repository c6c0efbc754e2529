pub mod client;
pub mod connections;

pub use client::EsClient;
pub use connections::setup_es;
pub use connections::shutdown_es;
pub use connections::ConnectionFactory;
pub use connections::ConnectionParams;
pub use connections::ConnectionRegistry;
pub use connections::EsConnectionFactory;
pub use connections::SearchConnection;
pub use connections::SearchSettings;
pub use connections::DEFAULT_ALIAS;
