use env_logger::Builder;
use log::LevelFilter;
use std::env;

/// Our own modules log at debug, everything else at info.
const DEFAULT_FILTERS: [(Option<&str>, LevelFilter); 2] = [
	(None, LevelFilter::Info),
	(Some(env!("CARGO_PKG_NAME")), LevelFilter::Debug),
];

fn builder(from_env: bool) -> Builder {
	use chrono::Local;
	use env_logger::fmt::style::Style;
	use std::io::Write;

	let mut logger = if from_env {
		Builder::from_default_env()
	} else {
		Builder::new()
	};
	logger.format(|buf, record| {
		let level_style = buf.default_level_style(record.level());
		let dim = Style::new().dimmed();

		writeln!(
			buf,
			"{dim}[{}{dim:#} {level_style}{: <5}{level_style:#} {dim}{}]{dim:#} {}",
			Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
			record.level(),
			record.target(),
			record.args()
		)
	});

	if !from_env {
		for (module, level) in DEFAULT_FILTERS {
			logger.filter(module, level);
		}
	}
	logger
}

pub fn init_logger() {
	builder(env::var_os("RUST_LOG").is_some()).init()
}
