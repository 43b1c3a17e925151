//! Guild to shard routing
//!
//! See https://discord.com/developers/docs/topics/gateway#sharding

use twilight_model::id::marker::GuildMarker;
use twilight_model::id::Id;

/// Shard that receives DMs and other non-guild traffic
pub const DM_SHARD: u32 = 0;

/// Shard index serving `guild_id` in a set of `shard_count` shards:
/// `(guild_id >> 22) % shard_count`. A zero count is treated as one.
pub fn shard_for_guild(guild_id: Id<GuildMarker>, shard_count: u32) -> u32 {
    let count = u64::from(shard_count.max(1));
    // Remainder is below shard_count, so it always fits.
    ((guild_id.get() >> 22) % count) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_example_routes_to_fixed_shard() {
        let guild = Id::new(155_116_927_361_871_872);
        assert_eq!(shard_for_guild(guild, 4), 0);
        assert_eq!(shard_for_guild(guild, 3), 1);
        assert_eq!(shard_for_guild(guild, 5), 1);
    }

    #[test]
    fn routing_is_stable_across_calls() {
        let guild = Id::new(81_384_788_765_712_384);
        let first = shard_for_guild(guild, 4);
        for _ in 0..10 {
            assert_eq!(shard_for_guild(guild, 4), first);
        }
        assert_eq!(first, 2);
    }

    #[test]
    fn single_shard_takes_everything() {
        assert_eq!(shard_for_guild(Id::new(613_425_648_685_547_541), 1), 0);
        assert_eq!(shard_for_guild(Id::new(613_425_648_685_547_541), 0), 0);
    }
}
