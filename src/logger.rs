use log::{Level, LevelFilter, Log, Metadata, Record};
use notify_rust::Notification;
use std::fmt;
use std::io::Write;

/// Backend for the `log` facade: records go to stderr, finished flashing
/// steps optionally pop up as desktop notifications.
pub struct Logger {
    appname: String,
    notification: bool,
    level: LevelFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Erase,
    Write,
    Read,
    Image,
}

impl EventType {
    /// Event of a `brutzel::flasher::<event>` log target.
    pub fn from_target(target: &str) -> Option<Self> {
        match target.strip_prefix("brutzel::flasher::")? {
            "erase" => Some(EventType::Erase),
            "write" => Some(EventType::Write),
            "read" => Some(EventType::Read),
            "image" => Some(EventType::Image),
            _ => None,
        }
    }
}

impl Logger {
    pub fn new(appname: String, notification: bool, level: LevelFilter) -> Self {
        Self {
            appname,
            notification,
            level,
        }
    }

    /// Install as the global logger.
    pub fn init(self) -> Result<(), log::SetLoggerError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }

    pub fn notify(&self, event_type: EventType, message: &str) {
        if self.notification {
            let _ = Notification::new()
                .summary(&self.appname)
                .appname(&self.appname)
                .body(&format!("{event_type} {message}"))
                .timeout(0)
                .show();
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = writeln!(
            std::io::stderr().lock(),
            "[{} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
        if record.level() == Level::Info {
            if let Some(event_type) = EventType::from_target(record.target()) {
                self.notify(event_type, &record.args().to_string());
            }
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            EventType::Erase => "Erase",
            EventType::Write => "Write",
            EventType::Read => "Read",
            EventType::Image => "Image",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flasher_targets() {
        assert_eq!(
            EventType::from_target("brutzel::flasher::erase"),
            Some(EventType::Erase)
        );
        assert_eq!(
            EventType::from_target("brutzel::flasher::image"),
            Some(EventType::Image)
        );
        assert_eq!(EventType::from_target("brutzel::flasher"), None);
        assert_eq!(EventType::from_target("brutzel::dfs"), None);
    }

    #[test]
    fn level_filter() {
        let logger = Logger::new("brutzel".to_string(), false, LevelFilter::Info);
        assert!(logger.enabled(&Metadata::builder().level(Level::Warn).build()));
        assert!(!logger.enabled(&Metadata::builder().level(Level::Debug).build()));
        assert_eq!(EventType::Write.to_string(), "Write");
    }
}
