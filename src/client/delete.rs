use futures::future::try_join_all;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;
use tracing::trace;

use super::ConnectionManager;
use crate::join_path;
use crate::validate_path;
use crate::Result;

impl ConnectionManager {
    /// Deletes `path` and everything below it.
    ///
    /// Keeps retrying while other clients create nodes inside the subtree, so
    /// it can take several rounds before returning. A subtree that is already
    /// gone is a success. For `/` only the children are deleted.
    pub async fn delete_recursive(
        &self,
        path: &str,
    ) -> Result<()> {
        validate_path(path)?;
        if path == "/" {
            return delete_children(self.clone(), path.to_string()).await;
        }
        delete_tree(self.clone(), path.to_string()).await
    }
}

fn delete_tree(
    client: ConnectionManager,
    path: String,
) -> BoxFuture<'static, Result<()>> {
    async move {
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            match client.delete(&path, None).await {
                // keep going until the node is reported missing; it may have
                // been recreated in the meantime
                Ok(()) => trace!(%path, "deleted"),
                Err(e) if e.is_no_node() => break,
                Err(e) if e.is_not_empty() => delete_children(client.clone(), path.clone()).await?,
                Err(e) => return Err(e),
            }
        }
        if rounds > 2 {
            debug!(%path, rounds, "recursive delete needed several rounds");
        }
        Ok(())
    }
    .boxed()
}

fn delete_children(
    client: ConnectionManager,
    path: String,
) -> BoxFuture<'static, Result<()>> {
    async move {
        // uncached: a listing served from cache may already be stale
        let children = match client.get_children_and_watch(&path).await {
            Ok((children, _watch)) => children,
            Err(e) if e.is_no_node() => return Ok(()),
            Err(e) => return Err(e),
        };

        try_join_all(
            children
                .into_iter()
                .map(|child| delete_tree(client.clone(), join_path(&path, &child))),
        )
        .await?;
        Ok(())
    }
    .boxed()
}
