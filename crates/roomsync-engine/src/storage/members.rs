use roomsync_core::EngineError;
use roomsync_store::{StoreName, Transaction, key};

use super::{get_record, put_record};
use crate::room::members::RoomMember;

pub(crate) fn get(
    txn: &dyn Transaction,
    room_id: &str,
    user_id: &str,
) -> Result<Option<RoomMember>, EngineError> {
    get_record(
        txn,
        StoreName::RoomMembers,
        &key::room_scoped(room_id, &[user_id]),
        "get_member",
    )
}

pub(crate) fn set(txn: &mut dyn Transaction, member: &RoomMember) -> Result<(), EngineError> {
    put_record(
        txn,
        StoreName::RoomMembers,
        &key::room_scoped(&member.room_id, &[&member.user_id]),
        member,
        "set_member",
    )
}
