pub mod sentry_logger;
