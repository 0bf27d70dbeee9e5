pub mod config;
pub mod safe_converter;

pub mod byte_stream;
pub mod stream_reassembler;
pub mod wrapping_integers;
pub mod segment;
pub mod timer;

pub mod sender;
pub mod receiver;
pub mod state;
pub mod connection;

pub mod udp_adapter;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
