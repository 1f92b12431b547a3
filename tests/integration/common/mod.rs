pub mod test_server;
pub mod upstream;
pub mod ws_client;
