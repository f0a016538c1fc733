/// Advisory majority check. This node always counts itself, so with `n`
/// configured peers the cluster has `n + 1` members and quorum needs a strict
/// majority of them. With zero or one configured peer quorum always holds.
pub fn has_quorum(configured: usize, connected: usize) -> bool {
    if configured <= 1 {
        return true;
    }
    (connected + 1) as f64 > (configured + 1) as f64 / 2.0
}
