use std::env;
use std::io::Write;

use env_logger::Builder;

pub fn init() {
    let mut builder = Builder::new();
    builder.format(|buf, record| {
        writeln!(buf, "[{}] {}: {}", buf.timestamp(), record.level(), record.args())
    });
    let config = env::var("RUST_LOG").unwrap_or_else(|_| "warn,vm_trainer=info".to_string());
    builder.parse_filters(&config);
    builder.init();
}
