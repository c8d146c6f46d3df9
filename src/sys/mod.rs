// 🛡️ The OS-touching layer. Everything here mutates host state through the
// CommandExecutor seam; the boundary service never reaches the OS directly.

pub mod exec;    // Privileged command execution
pub mod locks;   // Claim table + reload serialization
pub mod render;  // Virtual-host configuration rendering (pure)
pub mod ssl;     // Certificate issuance & lifecycle
pub mod users;   // OS account provisioning
pub mod vhost;   // Virtual-host provisioning (transactional core)
