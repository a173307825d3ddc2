mod common;

use std::time::Duration;

use manifold_backend_sqlx::metadata::TxOptions;
use manifold_backend_sqlx::Error;
use manifold_core::registries::{NewRegistry, Registry, RegistryRepository};
use manifold_core::{Error as CoreError, PrincipalId};

use common::*;

fn named(name: &str) -> NewRegistry {
    NewRegistry {
        parent_id: None,
        name: name.to_string(),
    }
}

#[tokio::test]
async fn ok_commits() {
    let db = sqlite().await;

    let created = db
        .pool
        .with_tx(write_opts(), |tx| {
            Box::pin(async move { Ok::<_, Error>(tx.create_registry(&named("kept")).await?) })
        })
        .await
        .unwrap();

    let mut conn = db.pool.conn(None).await.unwrap();
    assert_eq!(conn.find_registry(created.id).await.unwrap(), created);
}

#[tokio::test]
async fn err_rolls_back_everything() {
    let db = sqlite().await;

    let result: Result<Registry, Error> = db
        .pool
        .with_tx(write_opts(), |tx| {
            Box::pin(async move {
                tx.create_registry(&named("dropped")).await?;
                Err::<Registry, Error>(CoreError::InvalidInput("abort".to_string()).into())
            })
        })
        .await;
    assert!(matches!(
        result,
        Err(Error::ManifoldError(CoreError::InvalidInput(_)))
    ));

    let mut conn = db.pool.conn(None).await.unwrap();
    assert!(conn
        .find_registry_by_name(None, "dropped")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn elapsed_deadline_rolls_back() {
    let db = sqlite().await;
    let opts = write_opts().timeout(Duration::from_millis(20));

    let result: Result<(), Error> = db
        .pool
        .with_tx(opts, |tx| {
            Box::pin(async move {
                tx.create_registry(&named("slow")).await?;
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), Error>(())
            })
        })
        .await;
    assert!(matches!(
        result,
        Err(Error::ManifoldError(CoreError::DeadlineExceeded))
    ));

    let mut conn = db.pool.conn(None).await.unwrap();
    assert!(conn
        .find_registry_by_name(None, "slow")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn dropped_transaction_is_rolled_back() {
    let db = sqlite().await;
    {
        let mut tx = db.pool.begin(write_opts()).await.unwrap();
        tx.create_registry(&named("abandoned")).await.unwrap();
    }

    let mut conn = db.pool.conn(None).await.unwrap();
    assert!(conn
        .find_registry_by_name(None, "abandoned")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn readers_share_the_lock() {
    let db = sqlite().await;
    let registry = root_registry(&db.pool, "tenant").await;

    let mut first = db.pool.begin(TxOptions::read_only()).await.unwrap();
    let mut second = db.pool.begin(TxOptions::read_only()).await.unwrap();
    assert_eq!(first.find_registry(registry.id).await.unwrap(), registry);
    assert_eq!(second.find_registry(registry.id).await.unwrap(), registry);
    first.commit().await.unwrap();
    second.commit().await.unwrap();
}

#[tokio::test]
async fn principal_is_stamped_on_created_rows() {
    let db = sqlite().await;
    let opts = write_opts().principal(PrincipalId::new(7));

    let created = db
        .pool
        .with_tx(opts, |tx| {
            Box::pin(async move { Ok::<_, Error>(tx.create_registry(&named("owned")).await?) })
        })
        .await
        .unwrap();
    assert_eq!(created.created_by, Some(PrincipalId::new(7)));

    let unowned = root_registry(&db.pool, "unowned").await;
    assert_eq!(unowned.created_by, None);
}

#[tokio::test]
async fn duplicate_registry_name_is_reported() {
    let db = sqlite().await;
    root_registry(&db.pool, "tenant").await;

    let mut conn = db.pool.conn(None).await.unwrap();
    let err = conn.create_registry(&named("tenant")).await.unwrap_err();
    assert!(matches!(err, CoreError::Duplicate("registry")));
}

#[tokio::test]
async fn connection_write_waits_for_open_write_transaction() {
    let db = sqlite().await;
    let tenant = root_registry(&db.pool, "tenant").await;

    let mut tx = db.pool.begin(write_opts()).await.unwrap();
    assert_eq!(tx.find_registry(tenant.id).await.unwrap(), tenant);

    let pool = db.pool.clone();
    let outside = tokio::spawn(async move {
        let mut conn = pool.conn(None).await.unwrap();
        conn.create_registry(&named("outside")).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    tx.create_registry(&named("inside")).await.unwrap();
    tx.commit().await.unwrap();

    let outside = outside.await.unwrap().unwrap();
    let mut conn = db.pool.conn(None).await.unwrap();
    assert_eq!(conn.find_registry_by_name(None, "outside").await.unwrap(), outside);
    assert!(conn.find_registry_by_name(None, "inside").await.is_ok());
}
