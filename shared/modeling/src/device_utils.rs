use tch::Device;

/// Device for one rank of a `world_size` group: a dedicated GPU when the
/// machine has one per rank, otherwise the shared CPU.
pub fn rank_device(rank: usize, world_size: usize) -> Device {
    if tch::Cuda::is_available() && tch::Cuda::device_count() >= world_size as i64 {
        Device::Cuda(rank)
    } else {
        Device::Cpu
    }
}
