use clap::Parser;
use mrp_common::types::{MIN_CREDENTIAL_SIZE, PASSWORD_SIZE};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on the user directory size.
pub const MAX_USERS_LIMIT: u32 = 1 << 14;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "mrps")]
#[command(about = "MRP relay server")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "MRPS_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "MRPS_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Maximum concurrent connections (size of the connection id pool).
    #[arg(long, default_value = "100", env = "MRPS_MAX_CONNS")]
    pub max_conns: u32,
    /// Maximum number of registered users, admin included.
    #[arg(long, default_value = "100", env = "MRPS_MAX_USERS")]
    pub max_users: u32,
    /// Path to the server Ed25519 seed file.
    #[arg(long, env = "MRPS_KEYPAIR")]
    pub keypair: Option<PathBuf>,
    /// Password the admin account is seeded with.
    #[arg(long, default_value = "admin", env = "MRPS_ADMIN_PASSWORD", hide_env_values = true)]
    pub admin_password: String,
    /// Idle timeout between frames in milliseconds.
    #[arg(long, default_value = "60000", env = "MRPS_IDLE_TIMEOUT_MS")]
    pub idle_timeout_ms: u64,
    /// Deadline for a frame body once its length has arrived, in milliseconds.
    #[arg(long, default_value = "5000", env = "MRPS_PART_TIMEOUT_MS")]
    pub part_timeout_ms: u64,
    /// Maximum total lifetime of a connection in milliseconds.
    #[arg(long, default_value = "3600000", env = "MRPS_LIFETIME_MS")]
    pub lifetime_ms: u64,
    /// Seconds to wait for connections to finish on shutdown.
    #[arg(long, default_value = "30", env = "MRPS_DRAIN_TIMEOUT")]
    pub drain_timeout: u64,
    /// Argon2 memory cost in KiB.
    #[arg(long, default_value = "19456", env = "MRPS_HASH_MEMORY_KIB")]
    pub hash_memory_kib: u32,
    /// Argon2 iteration count.
    #[arg(long, default_value = "2", env = "MRPS_HASH_ITERATIONS")]
    pub hash_iterations: u32,
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_conns: u32,
    /// Maximum number of registered users.
    pub max_users: u32,
    /// Password the admin account is seeded with.
    pub admin_password: String,
    /// Idle timeout between frames in milliseconds.
    pub idle_timeout_ms: u64,
    /// Deadline for a frame body once its length has arrived, in milliseconds.
    pub part_timeout_ms: u64,
    /// Maximum total lifetime of a connection in milliseconds.
    pub lifetime_ms: u64,
    /// Seconds to wait for connections to finish on shutdown.
    pub drain_timeout: u64,
    /// Argon2 memory cost in KiB.
    pub hash_memory_kib: u32,
    /// Argon2 iteration count.
    pub hash_iterations: u32,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_users == 0 {
            return Err("max_users must be greater than 0".to_string());
        }
        if self.max_users > MAX_USERS_LIMIT {
            return Err(format!("max_users exceeds limit ({MAX_USERS_LIMIT})"));
        }

        let password = self.admin_password.as_bytes();
        if password.len() > PASSWORD_SIZE {
            return Err(format!(
                "admin_password exceeds maximum length ({PASSWORD_SIZE} bytes)"
            ));
        }
        if password.iter().filter(|b| **b != 0 && **b != b' ').count() < MIN_CREDENTIAL_SIZE {
            return Err(format!(
                "admin_password must contain at least {MIN_CREDENTIAL_SIZE} non-blank bytes"
            ));
        }

        if self.idle_timeout_ms == 0 {
            return Err("idle_timeout_ms must be greater than 0".to_string());
        }
        if self.idle_timeout_ms > 86_400_000 {
            return Err("idle_timeout_ms exceeds reasonable limit (1 day)".to_string());
        }

        if self.part_timeout_ms == 0 {
            return Err("part_timeout_ms must be greater than 0".to_string());
        }
        if self.part_timeout_ms > self.idle_timeout_ms {
            return Err("part_timeout_ms cannot exceed idle_timeout_ms".to_string());
        }

        if self.lifetime_ms == 0 {
            return Err("lifetime_ms must be greater than 0".to_string());
        }
        if self.lifetime_ms > 7 * 86_400_000 {
            return Err("lifetime_ms exceeds reasonable limit (7 days)".to_string());
        }

        if self.drain_timeout > 3600 {
            return Err("drain_timeout exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.hash_memory_kib < 8 {
            return Err("hash_memory_kib must be at least 8".to_string());
        }
        if self.hash_iterations == 0 {
            return Err("hash_iterations must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Idle deadline applied to every length-prefix read and write.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Deadline for the body that follows a length prefix.
    #[must_use]
    pub fn part_timeout(&self) -> Duration {
        Duration::from_millis(self.part_timeout_ms)
    }

    /// Maximum total lifetime of a connection.
    #[must_use]
    pub fn lifetime(&self) -> Duration {
        Duration::from_millis(self.lifetime_ms)
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            max_conns: args.max_conns,
            max_users: args.max_users,
            admin_password: args.admin_password,
            idle_timeout_ms: args.idle_timeout_ms,
            part_timeout_ms: args.part_timeout_ms,
            lifetime_ms: args.lifetime_ms,
            drain_timeout: args.drain_timeout,
            hash_memory_kib: args.hash_memory_kib,
            hash_iterations: args.hash_iterations,
        }
    }
}
