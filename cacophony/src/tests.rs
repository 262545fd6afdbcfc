//! Commands driving transactions against the durable model, end to end.

use std::collections::HashMap;

use anyhow::Result;

use crate::{
    config::Config,
    model::LocalDataModel,
    net::ThreadedScheduler,
    pin_cache::{self, PinCacheBuilder},
    projection::{FolloweeMutation, MiscMutation, PinCacheData},
    runner::{CommandError, CommandRunner, Context, Done, Published},
    test_utils::{key, logging, ChannelFixture, MockNode},
    transaction::ConcurrentTransaction,
    ChannelKey, Codec, ContentAddress,
};

#[derive(Debug)]
struct Env {
    model: LocalDataModel,
    network: ThreadedScheduler<MockNode>,
}

/// Pins `refs` once per reference, or unpins them if `release` is set, and commits.
fn apply_refs(env: &Env, refs: &PinCacheData, release: bool) -> Result<(), CommandError> {
    let existing = env.model.read().pins().snapshot_pinned_set();
    let mut txn = ConcurrentTransaction::new(&env.network, existing);
    for (address, count) in refs.iter() {
        for _ in 0..count {
            if release {
                txn.unpin(address);
            } else {
                txn.pin(address);
            }
        }
    }
    let mut write = env.model.write();
    txn.commit(&mut write.resolver(&env.network))?;
    write.commit()?;
    Ok(())
}

fn publish_home(ctx: &Context<Env>, root: ContentAddress) -> Result<Published, CommandError> {
    let env = ctx.env();
    let refs = PinCacheBuilder::new(&env.network).add_home_user(root)?.finish();
    apply_refs(env, &refs, false)?;
    let mut write = env.model.write();
    write.set_last_published_root(root);
    write.commit()?;
    Ok(Published(root))
}

fn follow(ctx: &Context<Env>, followee: ChannelKey, root: ContentAddress) -> Result<Done, CommandError> {
    let env = ctx.env();
    if env.model.read().followees().is_followed(&followee) {
        return Err(CommandError::Usage(format!("already following {}", followee.fmt_short())));
    }
    let refs = PinCacheBuilder::new(&env.network)
        .add_followee(root, &HashMap::new())?
        .finish();
    apply_refs(env, &refs, false)?;
    let mut write = env.model.write();
    write.define_followee(followee, root, 0);
    write.commit()?;
    Ok(Done)
}

fn unfollow(ctx: &Context<Env>, followee: ChannelKey) -> Result<Done, CommandError> {
    let env = ctx.env();
    let (root, cached) = {
        let read = env.model.read();
        let followees = read.followees();
        match (followees.last_fetched_root(&followee), followees.elements_for(&followee)) {
            (Some(root), Some(cached)) => (root, cached),
            _ => return Err(CommandError::Usage("not following".into())),
        }
    };
    let refs = PinCacheBuilder::new(&env.network)
        .add_followee(root, &cached)?
        .finish();
    apply_refs(env, &refs, true)?;
    let mut write = env.model.write();
    write.remove_followee(followee);
    write.commit()?;
    Ok(Done)
}

#[test]
fn publish_follow_unfollow() -> Result<()> {
    let _guard = logging::setup();
    let dir = tempfile::tempdir()?;
    let node = MockNode::default();
    let picture = node.store_bytes(&b"picture"[..], Codec::Raw);
    let attachment = node.store_bytes(&b"attachment"[..], Codec::Raw);
    let home_post = ChannelFixture::post(&node, key(1), "hello", Some(attachment))?;
    let home_root = ChannelFixture::new("Home", Some(picture)).publish(&node, &[home_post])?;
    let followee_post = ChannelFixture::post(&node, key(2), "theirs", None)?;
    let followee_root = ChannelFixture::new("Them", Some(picture)).publish(&node, &[followee_post])?;

    let config = Config {
        data_dir: dir.path().to_path_buf(),
        command_threads: 2,
        network_threads: 3,
        ..Config::default()
    };
    let env = Env {
        model: LocalDataModel::open_with(&config)?,
        network: ThreadedScheduler::from_config(node.clone(), &config)?,
    };
    let runner = CommandRunner::new(env, Some(key(1)));
    runner.start_threads_with(&config)?;

    let published = runner.run_command(move |ctx: &Context<Env>| publish_home(ctx, home_root), None);
    let followed = runner.run_command(move |ctx: &Context<Env>| follow(ctx, key(2), followee_root), None);
    let again = runner.run_command(move |ctx: &Context<Env>| follow(ctx, key(2), followee_root), None);
    assert_eq!(published.get()?, Published(home_root));
    assert_eq!(followed.get()?, Done);
    assert!(matches!(again.get(), Err(CommandError::Usage(_))));

    let env = runner.env().clone();
    {
        let read = env.model.read();
        assert_eq!(read.pins().count(&picture), 2);
        assert_eq!(read.pins().snapshot_pinned_set(), node.pinned());
        assert!(pin_cache::check_consistency(&read, &env.network)?.is_empty());
    }

    let unfollowed = runner.run_command(move |ctx: &Context<Env>| unfollow(ctx, key(2)), None);
    assert_eq!(unfollowed.get()?, Done);
    {
        let read = env.model.read();
        assert_eq!(read.pins().count(&picture), 1);
        assert!(!read.pins().is_pinned(&followee_root));
        assert!(!node.is_pinned(&followee_root));
        assert!(node.is_pinned(&picture));
        assert_eq!(read.pins().snapshot_pinned_set(), node.pinned());
        assert!(pin_cache::check_consistency(&read, &env.network)?.is_empty());
    }

    runner.shutdown_threads();
    let expected = env.model.read().clone();
    let reopened = LocalDataModel::open(dir.path())?;
    assert_eq!(*reopened.read(), expected);
    assert_eq!(reopened.read().channel().last_published_root(), Some(home_root));
    Ok(())
}

#[test]
fn failed_read_leaves_model_untouched() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let node = MockNode::default();
    let post = ChannelFixture::post(&node, key(1), "post", None)?;
    let root = ChannelFixture::new("Home", None).publish(&node, &[post])?;
    node.fail_calls_for(post);

    let env = Env {
        model: LocalDataModel::open(dir.path())?,
        network: ThreadedScheduler::new(node.clone(), 1)?,
    };
    let runner = CommandRunner::new(env, None);
    runner.start_threads(1)?;
    let res = runner.run_command(move |ctx: &Context<Env>| publish_home(ctx, root), None);
    assert!(matches!(res.get(), Err(CommandError::Network(_))));
    assert!(runner.env().model.read().pins().is_empty());
    assert_eq!(node.pin_calls(), 0);
    Ok(())
}
