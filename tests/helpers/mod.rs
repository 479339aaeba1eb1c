pub mod delegates;
pub mod mock_spdy_server;
