mod helpers;

use std::time::Duration;

use relayq::{DistributedLock, LockCluster};

async fn cluster() -> anyhow::Result<LockCluster> {
    Ok(LockCluster::connect(&helpers::lock_config()).await?)
}

#[tokio::test]
async fn acquire_and_release() -> anyhow::Result<()> {
    let cluster = cluster().await?;
    let mut lock =
        DistributedLock::new(cluster, helpers::random_key()).with_ttl(Duration::from_secs(3));

    assert!(lock.acquire(false).await);
    assert!(lock.is_active());
    assert!(lock.release().await);
    assert!(!lock.is_active());
    Ok(())
}

#[tokio::test]
async fn mutual_exclusion_under_contention() -> anyhow::Result<()> {
    let cluster = cluster().await?;
    let key = helpers::random_key();
    let mut l1 = DistributedLock::new(cluster.clone(), key.as_str()).with_ttl(Duration::from_secs(3));
    let mut l2 = DistributedLock::new(cluster, key.as_str()).with_ttl(Duration::from_secs(3));

    let (first, second) = tokio::join!(l1.acquire(false), l2.acquire(false));
    assert_eq!(
        u8::from(first) + u8::from(second),
        1,
        "exactly one contender may win"
    );
    Ok(())
}

#[tokio::test]
async fn locks_on_distinct_keys_are_independent() -> anyhow::Result<()> {
    let cluster = cluster().await?;
    let mut l1 = DistributedLock::new(cluster.clone(), helpers::random_key())
        .with_ttl(Duration::from_secs(16));
    let mut l2 =
        DistributedLock::new(cluster, helpers::random_key()).with_ttl(Duration::from_secs(16));

    assert!(l1.acquire(false).await);
    assert!(l2.acquire(false).await);
    assert!(l1.is_active());
    assert!(l2.is_active());
    Ok(())
}

#[tokio::test]
async fn release_hands_the_key_over() -> anyhow::Result<()> {
    let cluster = cluster().await?;
    let key = helpers::random_key();
    let mut l1 = DistributedLock::new(cluster.clone(), key.as_str()).with_ttl(Duration::from_secs(16));
    let mut l2 = DistributedLock::new(cluster, key.as_str()).with_ttl(Duration::from_secs(16));

    assert!(l1.acquire(false).await);
    assert!(!l2.acquire(false).await);
    assert!(!l2.is_active());

    assert!(l1.release().await);
    assert!(!l1.is_active());
    // Releasing again is safe and reports that nothing was held.
    assert!(!l1.release().await);

    assert!(l2.acquire(false).await);
    assert!(l2.is_active());
    Ok(())
}

#[tokio::test]
async fn expired_lock_is_acquirable_without_release() -> anyhow::Result<()> {
    let cluster = cluster().await?;
    let key = helpers::random_key();
    let ttl = Duration::from_secs(3);
    let mut l1 = DistributedLock::new(cluster.clone(), key.as_str()).with_ttl(ttl);
    let mut l2 = DistributedLock::new(cluster, key.as_str()).with_ttl(ttl);

    assert!(l1.acquire(false).await);
    assert!(!l2.acquire(false).await);

    tokio::time::sleep(ttl + Duration::from_millis(200)).await;

    assert!(l2.acquire(false).await);
    Ok(())
}

#[tokio::test]
async fn auto_renew_outlives_the_nominal_ttl() -> anyhow::Result<()> {
    let cluster = cluster().await?;
    let key = helpers::random_key();
    let ttl = Duration::from_secs(5);
    let mut l1 = DistributedLock::new(cluster.clone(), key.as_str()).with_ttl(ttl);
    let mut l2 = DistributedLock::new(cluster, key.as_str()).with_ttl(ttl);

    assert!(l1.acquire(true).await);
    assert!(!l2.acquire(false).await);

    tokio::time::sleep(ttl).await;

    // Renewal kept the segments alive past the nominal TTL.
    assert!(l1.is_active());
    assert!(!l2.acquire(false).await);

    assert!(l1.release().await);
    assert!(!l1.is_active());
    assert!(l2.acquire(false).await);
    Ok(())
}

#[tokio::test]
async fn three_way_contest_yields_at_most_one_holder() -> anyhow::Result<()> {
    let key = helpers::random_key();
    let mut a = DistributedLock::new(cluster().await?, key.as_str()).with_ttl(Duration::from_secs(16));
    let mut b = DistributedLock::new(cluster().await?, key.as_str()).with_ttl(Duration::from_secs(16));
    let mut c = DistributedLock::new(cluster().await?, key.as_str()).with_ttl(Duration::from_secs(16));

    let (ra, rb, rc) = tokio::join!(a.acquire(false), b.acquire(false), c.acquire(false));
    let winners = u8::from(ra) + u8::from(rb) + u8::from(rc);
    assert!(winners <= 1, "at most one contender may win, got {winners}");
    Ok(())
}
