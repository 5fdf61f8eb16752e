/// 未确认的持久化写入计数
///
/// 计数不为 0 时对账循环不会发出新的网络请求，保证服务器看到的状态
/// 不会领先于已经落盘的状态。
#[derive(Debug, Default)]
pub struct SyncBarrier {
    pending: usize,
}

impl SyncBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一次写入
    pub fn begin_write(&mut self) {
        self.pending += 1;
    }

    /// 写入已确认，返回此时是否已全部确认
    pub fn finish_write(&mut self) -> bool {
        debug_assert!(self.pending > 0, "finish_write without begin_write");
        self.pending = self.pending.saturating_sub(1);
        self.pending == 0
    }

    pub fn is_drained(&self) -> bool {
        self.pending == 0
    }

    pub fn pending(&self) -> usize {
        self.pending
    }
}
