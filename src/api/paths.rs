//! All Paths are recorded here for use throughout this codebase
pub mod base {
    pub const ROOT: &str = "/";
    pub const HEALTH: &str = "/health";
    pub const ABOUT: &str = "/about";
}

pub mod cluster {
    pub const MANAGERS: &str = "/api/v1/cluster";
    pub const NODES: &str = "/api/v1/cluster/:manager";
    pub const ADMIN: &str = "/api/v1/cluster/:manager/admin/:action/:node";
}

pub fn nodes_path(manager: &str) -> String {
    cluster::NODES.replace(":manager", manager)
}

pub fn admin_path(manager: &str, action: &str, node: &str) -> String {
    cluster::ADMIN
        .replace(":manager", manager)
        .replace(":action", action)
        .replace(":node", node)
}
