// SPDX-License-Identifier: MPL-2.0

//! Reloads the frame sequence when files appear in or vanish from its source.

use std::path::Path;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use sctk::reexports::calloop::{
    LoopHandle, channel,
    timer::{TimeoutAction, Timer},
};

use crate::CosmicFrames;

/// Bursts of events within this window cause a single reload.
const SETTLE: Duration = Duration::from_millis(250);

fn changes_listing(kind: &notify::EventKind) -> bool {
    matches!(
        kind,
        notify::EventKind::Create(_)
            | notify::EventKind::Remove(_)
            | notify::EventKind::Modify(ModifyKind::Name(
                RenameMode::To | RenameMode::From | RenameMode::Both
            ))
    )
}

/// Hand a watcher event to the event loop. Returns whether it was delivered.
fn forward(tx: &channel::SyncSender<notify::Event>, event: notify::Event) -> bool {
    match tx.send(event) {
        Ok(()) => true,
        Err(why) => {
            tracing::warn!(?why, "frame source event dropped, event loop is gone");
            false
        }
    }
}

/// Watch `source` and reload the frames of `state` when its listing changes.
///
/// The watcher stops when the returned value is dropped.
pub fn watch(
    handle: &LoopHandle<'static, CosmicFrames>,
    source: &Path,
) -> eyre::Result<RecommendedWatcher> {
    let (notify_tx, notify_rx) = channel::sync_channel(20);

    handle
        .insert_source(
            notify_rx,
            |event: channel::Event<notify::Event>, _, state: &mut CosmicFrames| match event {
                channel::Event::Msg(event) => {
                    if !changes_listing(&event.kind) || state.reload_pending {
                        return;
                    }

                    tracing::debug!(paths = ?event.paths, "frame source changed");
                    state.reload_pending = true;

                    let timer = state.loop_handle.insert_source(
                        Timer::from_duration(SETTLE),
                        |_, _, state: &mut CosmicFrames| {
                            state.reload_pending = false;
                            state.reload_frames();
                            TimeoutAction::Drop
                        },
                    );

                    if let Err(why) = timer {
                        state.reload_pending = false;
                        tracing::error!(error = %why.error, "failed to schedule frame reload");
                    }
                }

                channel::Event::Closed => {
                    tracing::debug!("frame source watcher closed");
                }
            },
        )
        .map_err(|err| eyre::eyre!("{}", err.error))?;

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                forward(&notify_tx, event);
            }
            Err(why) => tracing::warn!(?why, "frame source watch error"),
        },
        notify::Config::default(),
    )?;

    watcher.watch(source, RecursiveMode::NonRecursive)?;
    tracing::debug!(?source, "watching frame source");
    Ok(watcher)
}
